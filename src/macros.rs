/// Declares a facade interface and generates both ends of it.
///
/// ```ignore
/// worker_rpc::facade! {
///     pub trait MailFacade as "mail" {
///         client = MailClient;
///         dispatch = MailDispatch;
///
///         fn send_draft(draft_id: String) -> ();
///     }
/// }
/// ```
///
/// This expands to:
/// - `trait MailFacade`, for the backend to implement (`async fn` works),
/// - `MailClient`, a stub whose async methods post `facade` requests,
/// - `MailDispatch<T>`, which adapts any `T: MailFacade` into a
///   [LocalFacade](crate::facade::LocalFacade) for [expose_local](crate::expose_local).
///
/// Methods travel under their Rust names. Arguments are positional.
#[macro_export]
macro_rules! facade {
	(
		$(#[$meta:meta])*
		$vis:vis trait $name:ident as $wire:literal {
			client = $client:ident;
			dispatch = $dispatch:ident;

			$(
				$(#[$method_meta:meta])*
				fn $method:ident($($arg:ident: $arg_ty:ty),* $(,)?) -> $ret:ty;
			)*
		}
	) => {
		$(#[$meta])*
		$vis trait $name: Send + Sync + 'static {
			$(
				$(#[$method_meta])*
				fn $method(
					&self,
					$($arg: $arg_ty),*
				) -> impl ::std::future::Future<
					Output = ::std::result::Result<$ret, $crate::RemoteError>,
				> + Send;
			)*
		}

		#[derive(Clone, Debug)]
		$vis struct $client {
			facade: $crate::facade::FacadeClient,
		}

		impl $client {
			pub const FACADE: &'static str = $wire;

			pub fn new(queue: $crate::Queue) -> Self {
				Self {
					facade: $crate::facade::FacadeClient::new(queue, Self::FACADE),
				}
			}
		}

		// A caller rarely needs every method of a facade.
		#[allow(dead_code)]
		impl $client {
			$(
				$(#[$method_meta])*
				pub async fn $method(
					&self,
					$($arg: $arg_ty),*
				) -> ::std::result::Result<$ret, $crate::CallError> {
					self.facade
						.invoke(
							stringify!($method),
							vec![$($crate::facade::encode_arg(&$arg)?),*],
						)
						.await
				}
			)*
		}

		$vis struct $dispatch<T>(pub ::std::sync::Arc<T>);

		impl<T: $name> $dispatch<T> {
			pub fn shared(facade: ::std::sync::Arc<T>) -> Self {
				Self(facade)
			}

			pub fn into_local(
				self,
			) -> ::std::sync::Arc<dyn $crate::facade::LocalFacade> {
				::std::sync::Arc::new(self)
			}
		}

		impl<T: $name> $crate::facade::LocalFacade for $dispatch<T> {
			fn name(&self) -> &str {
				$wire
			}

			fn dispatch(
				&self,
				method: &str,
				args: ::std::vec::Vec<$crate::facade::Value>,
			) -> ::std::option::Option<$crate::facade::DispatchFuture> {
				match method {
					$(
						stringify!($method) => {
							let facade = ::std::sync::Arc::clone(&self.0);

							let future: $crate::facade::DispatchFuture =
								::std::boxed::Box::pin(async move {
									#[allow(unused_mut)]
									let mut args = $crate::facade::Args::new(args);
									$(
										let $arg: $arg_ty = args.next(stringify!($arg))?;
									)*
									args.finish()?;

									let value = facade.$method($($arg),*).await?;
									$crate::facade::encode_value(&value)
								});

							::std::option::Option::Some(future)
						}
					)*

					_ => {
						let _ = args;
						::std::option::Option::None
					}
				}
			}
		}
	};
}
