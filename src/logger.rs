use std::collections::HashMap;

/// Caps the level of noisy modules below the global one.
#[derive(Default)]
struct ModuleFilter {
	module_filters: HashMap<String, log::LevelFilter>,
}

impl ModuleFilter {
	pub fn add_module_filter(&mut self, module: &str, level: log::LevelFilter) {
		self.module_filters.insert(module.to_string(), level);
	}

	fn allows(&self, record: &log::Record) -> bool {
		let Some(module_path) = record.module_path() else {
			return true;
		};

		self.module_filters
			.iter()
			.filter(|(module, _)| module_path.starts_with(module.as_str()))
			.max_by_key(|(module, _)| module.len())
			.is_none_or(|(_, level)| record.level() <= *level)
	}
}

impl flexi_logger::filter::LogLineFilter for ModuleFilter {
	fn write(
		&self,
		now: &mut flexi_logger::DeferredNow,
		record: &log::Record,
		log_line_writer: &dyn flexi_logger::filter::LogLineWriter,
	) -> std::io::Result<()> {
		if self.allows(record) {
			log_line_writer.write(now, record)
		} else {
			Ok(())
		}
	}
}

/// `RUST_LOG` takes precedence over `level`.
pub fn setup_logger(
	level: log::LevelFilter,
) -> eyre::Result<flexi_logger::LoggerHandle> {
	let mut filter = ModuleFilter::default();

	filter.add_module_filter("mio", log::LevelFilter::Info);
	filter.add_module_filter("tokio_util", log::LevelFilter::Info);

	// Per-frame tracing is only wanted when asked for explicitly.
	filter.add_module_filter("worker_rpc::transport", log::LevelFilter::Debug);

	Ok(
		flexi_logger::Logger::try_with_env_or_str(
			level.as_str().to_ascii_lowercase(),
		)?
		.format(flexi_logger::colored_default_format)
		.filter(Box::new(filter))
		.log_to_stderr()
		.start()?,
	)
}
