//! Bridge-Me-Not Protocol Codec
//!
//! Pure encoders and decoders for the packed words and byte payloads that the
//! on-chain order protocol and escrow factory consume. Output here is a wire
//! contract with immutable contracts, so every encoder checks field widths
//! before packing and every decoder rejects inconsistent input instead of
//! guessing.
//!
//! # Example
//!
//! ```rust,ignore
//! use bridgemenot_protocol::{MakerTraits, TakerTraits};
//!
//! let traits = MakerTraits {
//!     has_extension: true,
//!     post_interaction: true,
//!     ..Default::default()
//! };
//! let word = traits.encode()?;
//! assert_eq!(MakerTraits::decode(word)?, traits);
//!
//! let taker = TakerTraits::for_extension(&extension)?;
//! taker.validate_extension(&extension)?;
//! ```

mod packing;

pub mod error;
pub mod traits;
pub mod timelocks;
pub mod extension;
pub mod order;
pub mod immutables;
pub mod artifact;

pub use error::{CodecError, CodecResult};
pub use traits::{MakerTraits, TakerTraits};
pub use timelocks::{Stage, TimelockDelays, Timelocks};
pub use extension::{EscrowExtension, Extension, ExtensionField};
pub use order::{order_domain, EscrowOrder, Order};
pub use immutables::{escrow_address, immutables_hash, EscrowImmutables};
pub use artifact::SwapArtifact;
