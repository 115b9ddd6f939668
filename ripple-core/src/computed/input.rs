//! Computed Inputs
//!
//! A [`ComputedInput`] is the identity of a memoized call: the method name
//! plus a fingerprint of its arguments. Two calls with equal inputs share one
//! cached node in the registry.
//!
//! The fingerprint is the MessagePack encoding of the arguments, so any
//! `Serialize` type can be used as an argument tuple. The hash is computed
//! once at construction; inputs are hashed on every registry lookup.

use std::fmt;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

#[derive(Clone)]
pub struct ComputedInput {
    method: Arc<str>,
    args: Arc<[u8]>,
    hash: u64,
}

impl ComputedInput {
    /// Create an input from a method name and its arguments.
    pub fn new<A>(method: &str, args: &A) -> Result<Self>
    where
        A: Serialize + ?Sized,
    {
        let args = rmp_serde::to_vec(args)?;
        Ok(Self::from_parts(method, args))
    }

    /// An input for a method without arguments.
    pub fn unit(method: &str) -> Self {
        Self::from_parts(method, Vec::new())
    }

    fn from_parts(method: &str, args: Vec<u8>) -> Self {
        let mut hasher = DefaultHasher::new();
        method.hash(&mut hasher);
        args.hash(&mut hasher);
        Self {
            method: Arc::from(method),
            args: Arc::from(args),
            hash: hasher.finish(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The encoded argument fingerprint.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Decode the arguments back into a typed value.
    pub fn decode_args<A: DeserializeOwned>(&self) -> Result<A> {
        Ok(rmp_serde::from_slice(&self.args)?)
    }
}

impl PartialEq for ComputedInput {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.method == other.method && self.args == other.args
    }
}

impl Eq for ComputedInput {}

impl Hash for ComputedInput {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for ComputedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.method, self.hash)
    }
}

impl fmt::Display for ComputedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.method, self.hash as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equal_arguments_give_equal_inputs() {
        let a = ComputedInput::new("users.get", &(1u32, "x")).unwrap();
        let b = ComputedInput::new("users.get", &(1u32, "x")).unwrap();
        let c = ComputedInput::new("users.get", &(2u32, "x")).unwrap();
        let d = ComputedInput::new("users.list", &(1u32, "x")).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn arguments_can_be_decoded() {
        let input = ComputedInput::new("kv.get", &("shard", "a/b")).unwrap();
        let (shard, key): (String, String) = input.decode_args().unwrap();
        assert_eq!(shard, "shard");
        assert_eq!(key, "a/b");
    }

    #[test]
    fn unit_inputs_compare_by_method() {
        assert_eq!(ComputedInput::unit("now"), ComputedInput::unit("now"));
        assert_ne!(ComputedInput::unit("now"), ComputedInput::unit("later"));
    }
}
