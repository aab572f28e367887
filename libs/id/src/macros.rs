//! Macros for defining typed ID types.

/// Macro to define a typed numeric ID for a resource kind.
///
/// This generates a newtype wrapper around `i64` with:
/// - A `KIND` constant used in error messages and log fields
/// - `new()` for values read back from the store, `try_new()` for untrusted input
/// - `parse()` to parse from a decimal string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` as a plain JSON number
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(ServerId, "server");
///
/// let server_id = ServerId::new(7);
/// let parsed: ServerId = "7".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this resource kind.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(i64);

        impl $name {
            /// The resource kind for this ID type.
            pub const KIND: &'static str = $kind;

            /// Wraps a value assigned by the store.
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// Wraps an untrusted value, rejecting zero and negatives.
            pub fn try_new(value: i64) -> Result<Self, $crate::IdError> {
                if value < 1 {
                    return Err($crate::IdError::NotPositive {
                        kind: Self::KIND,
                        actual: value,
                    });
                }
                Ok(Self(value))
            }

            /// Returns the underlying value.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }

            /// Parses an ID from its decimal string form.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty { kind: Self::KIND });
                }

                let value = s
                    .parse::<i64>()
                    .map_err(|_| $crate::IdError::InvalidNumber {
                        kind: Self::KIND,
                        actual: s.to_string(),
                    })?;

                Self::try_new(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let value = i64::deserialize(deserializer)?;
                Self::try_new(value).map_err(serde::de::Error::custom)
            }
        }
    };
}
