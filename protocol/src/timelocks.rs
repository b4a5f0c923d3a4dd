//! Escrow timelock word.
//!
//! The top 32 bits anchor the word at the escrow deployment timestamp. Each
//! stage below it is a 32-bit offset in seconds from that anchor. Escrows are
//! deployed with the anchor zeroed and the factory fills it in, so the same
//! delays produce a different word per deployment.

use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CodecResult};
use crate::packing::{extract_u64, place};

const STAGE_BITS: usize = 32;
const DEPLOYED_AT_OFFSET: usize = 224;

/// Timelock stages in on-chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Stage {
    SrcWithdrawal = 0,
    SrcPublicWithdrawal = 1,
    SrcCancellation = 2,
    SrcPublicCancellation = 3,
    DstWithdrawal = 4,
    DstPublicWithdrawal = 5,
    DstCancellation = 6,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::SrcWithdrawal,
        Stage::SrcPublicWithdrawal,
        Stage::SrcCancellation,
        Stage::SrcPublicCancellation,
        Stage::DstWithdrawal,
        Stage::DstPublicWithdrawal,
        Stage::DstCancellation,
    ];

    fn offset(self) -> usize {
        self as usize * STAGE_BITS
    }

    /// Whether this stage belongs to the source escrow.
    pub fn is_src(self) -> bool {
        (self as u8) < 4
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::SrcWithdrawal => "src_withdrawal",
            Stage::SrcPublicWithdrawal => "src_public_withdrawal",
            Stage::SrcCancellation => "src_cancellation",
            Stage::SrcPublicCancellation => "src_public_cancellation",
            Stage::DstWithdrawal => "dst_withdrawal",
            Stage::DstPublicWithdrawal => "dst_public_withdrawal",
            Stage::DstCancellation => "dst_cancellation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-stage delays in seconds after deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelockDelays {
    pub src_withdrawal: u32,
    pub src_public_withdrawal: u32,
    pub src_cancellation: u32,
    pub src_public_cancellation: u32,
    pub dst_withdrawal: u32,
    pub dst_public_withdrawal: u32,
    pub dst_cancellation: u32,
}

impl Default for TimelockDelays {
    fn default() -> Self {
        Self {
            src_withdrawal: 12,
            src_public_withdrawal: 300,
            src_cancellation: 600,
            src_public_cancellation: 900,
            dst_withdrawal: 12,
            dst_public_withdrawal: 240,
            dst_cancellation: 480,
        }
    }
}

impl TimelockDelays {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::SrcWithdrawal => self.src_withdrawal,
            Stage::SrcPublicWithdrawal => self.src_public_withdrawal,
            Stage::SrcCancellation => self.src_cancellation,
            Stage::SrcPublicCancellation => self.src_public_cancellation,
            Stage::DstWithdrawal => self.dst_withdrawal,
            Stage::DstPublicWithdrawal => self.dst_public_withdrawal,
            Stage::DstCancellation => self.dst_cancellation,
        }
    }

    /// Check stage ordering.
    ///
    /// On each side the private withdrawal opens no later than the public
    /// one, withdrawal closes before cancellation opens, and private
    /// cancellation opens no later than public cancellation. The destination
    /// becomes cancellable no later than the source.
    pub fn validate(&self) -> CodecResult<()> {
        let checks = [
            (
                self.src_withdrawal <= self.src_public_withdrawal,
                "src withdrawal opens after src public withdrawal",
            ),
            (
                self.src_public_withdrawal < self.src_cancellation,
                "src public withdrawal does not close before src cancellation",
            ),
            (
                self.src_cancellation <= self.src_public_cancellation,
                "src cancellation opens after src public cancellation",
            ),
            (
                self.dst_withdrawal <= self.dst_public_withdrawal,
                "dst withdrawal opens after dst public withdrawal",
            ),
            (
                self.dst_public_withdrawal < self.dst_cancellation,
                "dst public withdrawal does not close before dst cancellation",
            ),
            (
                self.dst_cancellation <= self.src_cancellation,
                "dst cancellation opens after src cancellation",
            ),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(CodecError::mismatch("timelocks", *reason)),
            None => Ok(()),
        }
    }
}

/// A deployment anchor together with stage delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timelocks {
    deployed_at: u32,
    delays: TimelockDelays,
}

impl Timelocks {
    /// Timelocks anchored at `deployed_at` (Unix seconds).
    pub fn new(deployed_at: u64, delays: TimelockDelays) -> CodecResult<Self> {
        delays.validate()?;
        let deployed_at = u32::try_from(deployed_at).map_err(|_| CodecError::EncodingOverflow {
            field: "deployed_at",
            bits: STAGE_BITS as u32,
        })?;
        Ok(Self {
            deployed_at,
            delays,
        })
    }

    /// Timelocks as signed into an order, before the factory sets the anchor.
    pub fn undeployed(delays: TimelockDelays) -> CodecResult<Self> {
        Self::new(0, delays)
    }

    /// The same delays re-anchored at a deployment timestamp.
    pub fn with_deployed_at(self, deployed_at: u64) -> CodecResult<Self> {
        Self::new(deployed_at, self.delays)
    }

    pub fn deployed_at(&self) -> u64 {
        self.deployed_at as u64
    }

    pub fn is_deployed(&self) -> bool {
        self.deployed_at != 0
    }

    pub fn delays(&self) -> &TimelockDelays {
        &self.delays
    }

    /// Absolute Unix second at which `stage` begins.
    pub fn stage_start(&self, stage: Stage) -> u64 {
        self.deployed_at() + self.delays.get(stage) as u64
    }

    /// Whether `stage` permits its action at `now`.
    ///
    /// Withdrawal stages close when the matching cancellation stage opens.
    /// Cancellation stages never close.
    pub fn is_open(&self, stage: Stage, now: u64) -> bool {
        if now < self.stage_start(stage) {
            return false;
        }
        match stage {
            Stage::SrcWithdrawal | Stage::SrcPublicWithdrawal => {
                now < self.stage_start(Stage::SrcCancellation)
            }
            Stage::DstWithdrawal | Stage::DstPublicWithdrawal => {
                now < self.stage_start(Stage::DstCancellation)
            }
            Stage::SrcCancellation | Stage::SrcPublicCancellation | Stage::DstCancellation => true,
        }
    }

    /// Every stage open at `now`, in on-chain order.
    pub fn open_stages(&self, now: u64) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.is_open(*stage, now))
            .collect()
    }

    /// Whether either escrow can be cancelled at `now`.
    pub fn any_cancellation_open(&self, now: u64) -> bool {
        self.is_open(Stage::SrcCancellation, now) || self.is_open(Stage::DstCancellation, now)
    }

    pub fn encode(&self) -> U256 {
        Stage::ALL.into_iter().fold(
            U256::from(self.deployed_at) << DEPLOYED_AT_OFFSET,
            |word, stage| word | U256::from(self.delays.get(stage)) << stage.offset(),
        )
    }

    /// Checked variant of [`encode`](Self::encode) for delays built by hand.
    pub fn encode_checked(deployed_at: u64, delays: &TimelockDelays) -> CodecResult<U256> {
        let mut word = place(
            "deployed_at",
            U256::from(deployed_at),
            DEPLOYED_AT_OFFSET,
            STAGE_BITS,
        )?;
        for stage in Stage::ALL {
            word |= U256::from(delays.get(stage)) << stage.offset();
        }
        Ok(word)
    }

    /// Decode a timelock word, rejecting stage orderings the escrow would never honour.
    pub fn decode(word: U256) -> CodecResult<Self> {
        let stage = |s: Stage| extract_u64(word, s.offset(), STAGE_BITS) as u32;
        let delays = TimelockDelays {
            src_withdrawal: stage(Stage::SrcWithdrawal),
            src_public_withdrawal: stage(Stage::SrcPublicWithdrawal),
            src_cancellation: stage(Stage::SrcCancellation),
            src_public_cancellation: stage(Stage::SrcPublicCancellation),
            dst_withdrawal: stage(Stage::DstWithdrawal),
            dst_public_withdrawal: stage(Stage::DstPublicWithdrawal),
            dst_cancellation: stage(Stage::DstCancellation),
        };
        let deployed_at = extract_u64(word, DEPLOYED_AT_OFFSET, STAGE_BITS);
        Self::new(deployed_at, delays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn delays() -> TimelockDelays {
        TimelockDelays {
            src_withdrawal: 10,
            src_public_withdrawal: 120,
            src_cancellation: 121,
            src_public_cancellation: 122,
            dst_withdrawal: 10,
            dst_public_withdrawal: 100,
            dst_cancellation: 101,
        }
    }

    #[test]
    fn test_default_delays_are_valid() {
        TimelockDelays::default().validate().unwrap();
    }

    #[test]
    fn test_word_layout() {
        let word = Timelocks::new(1_700_000_000, delays()).unwrap().encode();

        assert_eq!(word >> 224, U256::from(1_700_000_000u64));
        assert_eq!(word & U256::from(u32::MAX), U256::from(10u64));
        assert_eq!((word >> 64) & U256::from(u32::MAX), U256::from(121u64));
        assert_eq!((word >> 192) & U256::from(u32::MAX), U256::from(101u64));
    }

    #[test]
    fn test_encode_checked_matches() {
        let timelocks = Timelocks::new(1_700_000_000, delays()).unwrap();
        assert_eq!(
            Timelocks::encode_checked(1_700_000_000, &delays()).unwrap(),
            timelocks.encode()
        );
        assert!(matches!(
            Timelocks::encode_checked(1 << 32, &delays()),
            Err(CodecError::EncodingOverflow { field: "deployed_at", bits: 32 })
        ));
    }

    #[test]
    fn test_deployed_at_overflow() {
        assert!(matches!(
            Timelocks::new(u64::from(u32::MAX) + 1, delays()),
            Err(CodecError::EncodingOverflow { field: "deployed_at", .. })
        ));
    }

    #[test]
    fn test_stage_windows() {
        let timelocks = Timelocks::new(1_000, delays()).unwrap();

        assert_eq!(timelocks.stage_start(Stage::SrcCancellation), 1_121);
        assert!(timelocks.open_stages(1_005).is_empty());
        assert_eq!(
            timelocks.open_stages(1_010),
            vec![Stage::SrcWithdrawal, Stage::DstWithdrawal]
        );
        assert!(timelocks.is_open(Stage::DstPublicWithdrawal, 1_100));
        assert!(!timelocks.is_open(Stage::DstWithdrawal, 1_101));
        assert!(timelocks.is_open(Stage::DstCancellation, 1_101));
        assert!(timelocks.is_open(Stage::SrcWithdrawal, 1_101));
        assert!(!timelocks.is_open(Stage::SrcPublicWithdrawal, 1_121));
        assert!(timelocks.any_cancellation_open(1_101));
        assert!(!timelocks.any_cancellation_open(1_100));
    }

    #[test]
    fn test_reanchoring_keeps_delays() {
        let signed = Timelocks::undeployed(delays()).unwrap();
        assert!(!signed.is_deployed());

        let deployed = signed.with_deployed_at(5_000).unwrap();
        assert_eq!(deployed.delays(), signed.delays());
        assert_eq!(deployed.stage_start(Stage::SrcWithdrawal), 5_010);
    }

    #[test]
    fn test_bad_ordering_rejected() {
        let mut bad = delays();
        bad.dst_cancellation = 200;
        assert!(matches!(
            Timelocks::undeployed(bad),
            Err(CodecError::DecodeMismatch { field: "timelocks", .. })
        ));

        let mut bad = delays();
        bad.src_public_withdrawal = 5;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_absolute_scheme_word_rejected() {
        // Absolute timestamps packed as two 128-bit halves.
        let withdrawal = U256::from(1_700_000_000u64);
        let cancellation = U256::from(1_700_003_600u64);
        let word = cancellation << 128 | withdrawal;

        assert!(matches!(
            Timelocks::decode(word),
            Err(CodecError::DecodeMismatch { field: "timelocks", .. })
        ));
    }

    /// Valid delays built from non-negative gaps between consecutive stages.
    fn delays_strategy() -> impl Strategy<Value = TimelockDelays> {
        (
            0u32..1_000,
            0u32..1_000,
            1u32..1_000,
            0u32..1_000,
            0u32..1_000,
            1u32..1_000,
            0u32..1_000,
        )
            .prop_map(|gaps| {
                let (dst_w, dst_pw_gap, dst_c_gap, src_c_gap, src_pc_gap, src_pw_back, src_w_back) =
                    gaps;
                let dst_public_withdrawal = dst_w + dst_pw_gap;
                let dst_cancellation = dst_public_withdrawal + dst_c_gap;
                let src_cancellation = dst_cancellation + src_c_gap;
                // dst_cancellation >= 1, so this stays strictly below src_cancellation.
                let src_public_withdrawal = src_cancellation - src_pw_back.min(src_cancellation);
                TimelockDelays {
                    src_withdrawal: src_public_withdrawal - src_w_back.min(src_public_withdrawal),
                    src_public_withdrawal,
                    src_cancellation,
                    src_public_cancellation: src_cancellation + src_pc_gap,
                    dst_withdrawal: dst_w,
                    dst_public_withdrawal,
                    dst_cancellation,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_timelocks_round_trip(delays in delays_strategy(), deployed_at in any::<u32>()) {
            let timelocks = Timelocks::new(deployed_at as u64, delays).unwrap();
            prop_assert_eq!(Timelocks::decode(timelocks.encode()).unwrap(), timelocks);
        }
    }
}
