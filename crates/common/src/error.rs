/// Error types that can be built from a bare message.
///
/// Library crates implement it for their `Error` and then expand
/// [`impl_context!`] next to it.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;

    /// `"{context}: {source}"`, the shape every wrapped error renders as.
    fn wrap(context: impl std::fmt::Display, source: impl std::fmt::Display) -> Self {
        Self::from_message(format!("{context}: {source}"))
    }
}

/// Expand a crate-local `Context` extension trait for `Result` and `Option`.
///
/// The error type defaults to `Error` in the calling module; pass another
/// path to target a different type. A `Result<T>` alias for that error must
/// be in scope.
///
/// ```ignore
/// // crates/hosts/src/error.rs
/// codehost_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        $crate::impl_context!(Error);
    };
    ($err:ty) => {
        /// Attach a message to a failure, turning it into this crate's error.
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T>;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.map_err(|e| <$err as $crate::FromMessage>::wrap(context.into(), e))
            }

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.map_err(|e| <$err as $crate::FromMessage>::wrap(f().into(), e))
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C: Into<String>>(self, f: impl FnOnce() -> C) -> Result<T> {
                self.ok_or_else(|| <$err as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}
