//! Metrics and log records emitted by the controller and the workers.

mod adaptive_concurrency;

pub use self::adaptive_concurrency::*;

/// Declares a pre-registered event handle.
///
/// Each block generates `<Name>Handle`, a cloneable struct holding the
/// listed metric handles, with a `register()` constructor and the given
/// `emit` method.
#[macro_export]
macro_rules! registered_event {
    (
        $event:ident => {
            $( $field:ident: $type:ty = $value:expr, )*
        }

        fn emit(&$slf:ident, $data_name:ident: $data:ty)
        $emit_body:block
    ) => {
        paste::paste! {
            #[derive(Clone)]
            pub struct [<$event Handle>] {
                $( $field: $type, )*
            }

            impl [<$event Handle>] {
                pub fn register() -> Self {
                    Self {
                        $( $field: $value, )*
                    }
                }

                pub fn emit(&$slf, $data_name: $data)
                $emit_body
            }

            impl ::std::fmt::Debug for [<$event Handle>] {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    f.debug_struct(stringify!([<$event Handle>])).finish_non_exhaustive()
                }
            }
        }
    };
}
