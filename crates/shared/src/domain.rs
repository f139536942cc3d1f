use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

macro_rules! digest_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

digest_newtype!(WidgetId);
digest_newtype!(CacheKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a cached function: a stable digest over the function's
/// qualified name plus a version marker chosen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionKey(pub String);

impl FunctionKey {
    pub fn derive(qualified_name: &str, version: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(qualified_name.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(version.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl CacheKey {
    pub fn derive(function_key: &FunctionKey, arg_hash: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(function_key.as_str().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(arg_hash.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

/// Position of a UI node in the render tree: an ordered list of child
/// indices from the root container down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaPath(pub Vec<u32>);

impl DeltaPath {
    pub fn root_child(index: u32) -> Self {
        Self(vec![index])
    }

    pub fn child(&self, index: u32) -> Self {
        let mut indices = self.0.clone();
        indices.push(index);
        Self(indices)
    }
}

impl fmt::Display for DeltaPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for index in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            first = false;
            write!(f, "{index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_path_displays_dotted_indices() {
        assert_eq!(DeltaPath(vec![0, 2, 1]).to_string(), "0.2.1");
        assert_eq!(DeltaPath::root_child(3).to_string(), "3");
    }

    #[test]
    fn function_key_is_stable_for_same_inputs() {
        let a = FunctionKey::derive("demo::load_table", "v1");
        let b = FunctionKey::derive("demo::load_table", "v1");
        let c = FunctionKey::derive("demo::load_table", "v2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn cache_key_separates_function_and_args() {
        let fk = FunctionKey::derive("demo::load_table", "v1");
        let a = CacheKey::derive(&fk, "aa");
        let b = CacheKey::derive(&fk, "ab");
        assert_ne!(a, b);
    }
}
