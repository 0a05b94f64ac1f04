//! CodecRegistry - codec tag to decoder lookup
//!
//! Blocks carry their codec in their content id. The registry maps that
//! codec to the function that parses the block into a `Node`, so recovery
//! nodes are decoded as `RecoveryNode` rather than as plain nodes.
//!
//! The registry is a plain value. It is filled once at start-up, wrapped
//! in an `Arc`, and injected into every component that decodes blocks.
//! Tests build their own isolated registries.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use dagheal::node::CodecRegistry;
//! use dagheal::reedsolomon;
//!
//! let mut registry = CodecRegistry::default(); // raw + dag-node
//! reedsolomon::register(&mut registry);        // + recovery-reedsolomon
//! let registry = Arc::new(registry);
//! ```

use std::collections::HashMap;

use crate::cid::{codec_name, DAG_NODE, RAW};
use crate::error::{RecoveryError, Result};
use crate::node::{Block, Node, ProtoNode, RawNode};

/// Parses a block whose codec matched the registration.
pub type DecodeFn = fn(&Block) -> Result<Node>;

#[derive(Clone)]
pub struct CodecRegistry {
    decoders: HashMap<u64, DecodeFn>,
}

impl CodecRegistry {
    /// Registry with no decoders at all.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `decode` for `codec`, returning the decoder it replaced.
    pub fn register(&mut self, codec: u64, decode: DecodeFn) -> Option<DecodeFn> {
        self.decoders.insert(codec, decode)
    }

    pub fn is_registered(&self, codec: u64) -> bool {
        self.decoders.contains_key(&codec)
    }

    /// Registered codecs, sorted.
    pub fn codecs(&self) -> Vec<u64> {
        let mut codecs: Vec<u64> = self.decoders.keys().copied().collect();
        codecs.sort_unstable();
        codecs
    }

    /// Decode a block with the decoder registered for its codec.
    pub fn decode(&self, block: &Block) -> Result<Node> {
        let codec = block.cid().codec();
        let decode = self
            .decoders
            .get(&codec)
            .ok_or(RecoveryError::UnknownCodec(codec))?;
        decode(block)
    }
}

impl Default for CodecRegistry {
    /// Raw and plain-node decoders.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(RAW, decode_raw);
        registry.register(DAG_NODE, decode_proto);
        registry
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .codecs()
            .into_iter()
            .map(|c| codec_name(c).map(str::to_string).unwrap_or_else(|| format!("{:#x}", c)))
            .collect();
        f.debug_struct("CodecRegistry").field("codecs", &names).finish()
    }
}

fn decode_raw(block: &Block) -> Result<Node> {
    Ok(Node::Raw(RawNode::new(block.data().to_vec())))
}

fn decode_proto(block: &Block) -> Result<Node> {
    Ok(Node::Proto(ProtoNode::decode(block.data())?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::RECOVERY_REEDSOLOMON;

    #[test]
    fn test_default_decodes_raw_and_plain() {
        let registry = CodecRegistry::default();

        let raw = Node::raw("payload");
        assert_eq!(registry.decode(&raw.to_block()).unwrap(), raw);

        let plain = Node::with_data("1234567890");
        assert_eq!(registry.decode(&plain.to_block()).unwrap(), plain);
    }

    #[test]
    fn test_unknown_codec() {
        let registry = CodecRegistry::default();
        let block = Block::new(RECOVERY_REEDSOLOMON, vec![0]);
        assert!(matches!(
            registry.decode(&block),
            Err(RecoveryError::UnknownCodec(RECOVERY_REEDSOLOMON))
        ));
    }

    #[test]
    fn test_registries_are_isolated() {
        let mut a = CodecRegistry::empty();
        let b = CodecRegistry::empty();

        assert!(a.register(RAW, decode_raw).is_none());
        assert!(a.register(RAW, decode_raw).is_some());
        assert!(a.is_registered(RAW));
        assert!(!b.is_registered(RAW));
    }

    #[test]
    fn test_codecs_sorted() {
        assert_eq!(CodecRegistry::default().codecs(), vec![RAW, DAG_NODE]);
    }
}
