//! Tiled Merkle tree primitives for a transparency log.
//!
//! The tree follows RFC 6962 section 2.1: leaves are hashed with a `0x00`
//! domain prefix, interior nodes with `0x01`, and the hashes are stored in
//! the dense post-order described in Crosby and Wallach's "Efficient Data
//! Structures for Tamper-Evident Logging". Interior hashes are grouped into
//! fixed-height tiles addressable as individual backend objects, per
//! <https://research.swtch.com/tlog#tiling_a_log>.
//!
//! This crate provides the hash and index math ([`tlog`]), tile coordinates
//! and authenticated tile reads ([`tile`]), and the checkpoint text format
//! ([`checkpoint`]).

pub mod checkpoint;
pub mod tile;
pub mod tlog;

pub use checkpoint::*;
pub use tile::*;
pub use tlog::*;
