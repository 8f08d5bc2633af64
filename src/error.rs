//! Engine errors.
//!
//! Declaration and reference errors surface synchronously to the caller of
//! `execute()`; errors raised deep inside a scheduled re-execution are
//! funneled to the scheduler's reporting hook instead (there is no direct
//! caller to receive a return value there).

use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// Duplicate or kind-incompatible declaration of a name in one scope.
    #[error("identifier '{name}' has already been declared")]
    DeclarationConflict {
        /// The redeclared name.
        name: String,
    },

    /// Write to a `const` binding.
    #[error("assignment to constant variable '{name}'")]
    AssignmentToConstant {
        /// The constant's name.
        name: String,
    },

    /// Name lookup exhausted the scope chain.
    #[error("'{name}' is not defined")]
    Unresolved {
        /// The name that failed to resolve.
        name: String,
    },

    /// A loop iteratee was not an object or array.
    #[error("{type_name} is not iterable")]
    NotIterable {
        /// Type tag of the offending value.
        type_name: &'static str,
    },

    /// A destructuring source was not an object or array.
    #[error("cannot destructure {type_name}")]
    NotDestructurable {
        /// Type tag of the offending value.
        type_name: &'static str,
    },

    /// A property write landed on a primitive.
    #[error("cannot set property '{key}' of {type_name}")]
    NotIndexable {
        /// The key being written.
        key: String,
        /// Type tag of the offending value.
        type_name: &'static str,
    },

    /// The unit was torn down while a handle to it was still live.
    #[error("unit is gone")]
    UnitGone,

    /// Failure raised by an embedded closure.
    #[error("{0}")]
    Closure(String),
}

impl Error {
    /// Wrap an arbitrary closure failure message.
    pub fn closure(message: impl Into<String>) -> Self {
        Error::Closure(message.into())
    }
}
