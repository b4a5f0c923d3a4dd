//! Simulation scenarios.

use bridgemenot_common::SwapStatus;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Commit fresh maker orders through the first running instance.
    CommitOrders { count: usize },
    /// Every running instance races to advance every swap short of `until`,
    /// round after round, until a round makes no progress.
    Drive { until: SwapStatus },
    /// Move every chain clock forward.
    AdvanceClock { seconds: u64 },
    /// Take the locks of every pending swap and stop without releasing them.
    Crash { instance: usize, lock_ttl_ms: u64 },
    /// Sleep in wall-clock time.
    Wait { millis: u64 },
    /// Refund every pending swap at the current chain time.
    CancelAll,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Exactly `count` swaps are in `status`.
    StatusCount { status: SwapStatus, count: usize },
    /// Exactly `count` escrows were deployed across all chains.
    Deployments { count: u64 },
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str, swaps: usize) -> anyhow::Result<Self> {
        match name {
            "contention" => Ok(Self::contention(swaps)),
            "crash-recovery" => Ok(Self::crash_recovery(swaps)),
            "cancellation" => Ok(Self::cancellation(swaps)),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Every instance races on the same swaps; each escrow is deployed once.
    fn contention(swaps: usize) -> Self {
        Self {
            name: "contention".to_string(),
            description: "All instances race every swap to completion".to_string(),
            steps: vec![
                ScenarioStep::CommitOrders { count: swaps },
                ScenarioStep::Drive {
                    until: SwapStatus::DstEscrowDeployed,
                },
                ScenarioStep::AdvanceClock { seconds: 20 },
                ScenarioStep::Drive {
                    until: SwapStatus::Completed,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::StatusCount {
                        status: SwapStatus::Completed,
                        count: swaps,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Deployments {
                        count: 2 * swaps as u64,
                    },
                },
            ],
        }
    }

    /// An instance dies holding locks; survivors take over once leases lapse.
    fn crash_recovery(swaps: usize) -> Self {
        Self {
            name: "crash-recovery".to_string(),
            description: "Instance 0 crashes mid-flight holding every swap lock".to_string(),
            steps: vec![
                ScenarioStep::CommitOrders { count: swaps },
                ScenarioStep::Drive {
                    until: SwapStatus::SrcEscrowDeployed,
                },
                ScenarioStep::Crash {
                    instance: 0,
                    lock_ttl_ms: 500,
                },
                ScenarioStep::Wait { millis: 600 },
                ScenarioStep::Drive {
                    until: SwapStatus::DstEscrowDeployed,
                },
                ScenarioStep::AdvanceClock { seconds: 20 },
                ScenarioStep::Drive {
                    until: SwapStatus::Completed,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::StatusCount {
                        status: SwapStatus::Completed,
                        count: swaps,
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::Deployments {
                        count: 2 * swaps as u64,
                    },
                },
            ],
        }
    }

    /// The secret is never revealed; both escrows refund after the window opens.
    fn cancellation(swaps: usize) -> Self {
        Self {
            name: "cancellation".to_string(),
            description: "Swaps stall after both deployments and are refunded".to_string(),
            steps: vec![
                ScenarioStep::CommitOrders { count: swaps },
                ScenarioStep::Drive {
                    until: SwapStatus::DstEscrowDeployed,
                },
                ScenarioStep::AdvanceClock { seconds: 600 },
                ScenarioStep::CancelAll,
                ScenarioStep::Assert {
                    condition: AssertCondition::StatusCount {
                        status: SwapStatus::Cancelled,
                        count: swaps,
                    },
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_scenarios_load() {
        for name in ["contention", "crash-recovery", "cancellation"] {
            let scenario = Scenario::load(name, 3).unwrap();
            assert_eq!(scenario.name, name);
            assert!(matches!(scenario.steps[0], ScenarioStep::CommitOrders { count: 3 }));
        }
        assert!(Scenario::load("high-volume", 3).is_err());
    }
}
