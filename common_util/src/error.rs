// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Common error types shared by every crate in the workspace.

use std::error::Error as StdError;

/// A boxed, type-erased error. Used at crate boundaries where callers should
/// not need to know the concrete error type of a collaborator.
pub type GenericError = Box<dyn StdError + Send + Sync>;

pub type GenericResult<T> = std::result::Result<T, GenericError>;

/// Lifts any [`std::error::Error`] into a [`GenericError`] without an
/// intermediate `.map_err(|e| Box::new(e) as _)`.
pub trait BoxError {
    fn box_err(self) -> GenericError;
}

impl<E: StdError + Send + Sync + 'static> BoxError for E {
    fn box_err(self) -> GenericError {
        Box::new(self)
    }
}

/// Declares a crate-local `Result<T>` alias over `Result<T, $t>`, the way
/// every error module in this workspace does instead of repeating the full
/// `std::result::Result<T, Error>` signature on every function.
#[macro_export]
macro_rules! define_result {
    ($t:ty) => {
        pub type Result<T> = std::result::Result<T, $t>;
    };
}
