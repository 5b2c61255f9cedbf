//! The immutable per-call execution environment and gas accounting.

use ethereum_types::U256;
use serde::{Deserialize, Serialize};

/// Gas in the rollup's two dimensions: L2 execution gas and data-availability
/// gas.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Gas {
    /// L2 execution gas.
    pub l2: u64,
    /// Data-availability gas.
    pub da: u64,
}

impl Gas {
    /// Zero gas in both dimensions.
    pub const ZERO: Self = Self { l2: 0, da: 0 };

    /// Constructs a gas amount.
    pub const fn new(l2: u64, da: u64) -> Self {
        Self { l2, da }
    }

    /// Whether both dimensions cover `cost`.
    pub const fn covers(&self, cost: Gas) -> bool {
        self.l2 >= cost.l2 && self.da >= cost.da
    }

    /// Component-wise saturating subtraction.
    pub const fn saturating_sub(self, other: Gas) -> Self {
        Self {
            l2: self.l2.saturating_sub(other.l2),
            da: self.da.saturating_sub(other.da),
        }
    }

    /// Component-wise saturating addition.
    pub const fn saturating_add(self, other: Gas) -> Self {
        Self {
            l2: self.l2.saturating_add(other.l2),
            da: self.da.saturating_add(other.da),
        }
    }

    /// Component-wise minimum; used to clamp a nested call's gas allocation
    /// to what the parent has left.
    pub fn min(self, other: Gas) -> Self {
        Self {
            l2: self.l2.min(other.l2),
            da: self.da.min(other.da),
        }
    }

    /// Scales both dimensions by an element count, saturating.
    pub const fn scaled(self, n: u64) -> Self {
        Self {
            l2: self.l2.saturating_mul(n),
            da: self.da.saturating_mul(n),
        }
    }
}

/// Block-level constants visible to every call of a transaction.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct GlobalVariables {
    /// The chain id.
    pub chain_id: U256,
    /// The rollup version.
    pub version: U256,
    /// The block number.
    pub block_number: u64,
    /// The block timestamp.
    pub timestamp: u64,
    /// Base fee per unit of L2 gas.
    pub fee_per_l2_gas: u128,
    /// Base fee per unit of DA gas.
    pub fee_per_da_gas: u128,
}

/// The immutable environment of a single call frame.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExecutionEnvironment {
    /// The contract being executed.
    pub address: U256,
    /// The calling contract (or transaction origin at depth 0).
    pub sender: U256,
    /// The function selector being invoked.
    pub function_selector: u32,
    /// Field-element calldata.
    pub calldata: Vec<U256>,
    /// Whether this frame (or any ancestor) is a static call.
    pub is_static_call: bool,
    /// Nesting depth; 0 for the top-level call.
    pub depth: usize,
    /// Block-level globals.
    pub globals: GlobalVariables,
}

impl ExecutionEnvironment {
    /// The environment of a regular nested call. A static ancestor keeps the
    /// whole subtree static.
    pub fn nested(&self, callee: U256, calldata: Vec<U256>, selector: u32) -> Self {
        Self {
            address: callee,
            sender: self.address,
            function_selector: selector,
            calldata,
            is_static_call: self.is_static_call,
            depth: self.depth + 1,
            globals: self.globals,
        }
    }

    /// The environment of a nested static call.
    pub fn nested_static(&self, callee: U256, calldata: Vec<U256>, selector: u32) -> Self {
        Self {
            is_static_call: true,
            ..self.nested(callee, calldata, selector)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_covers_is_per_dimension() {
        let gas = Gas::new(100, 5);
        assert!(gas.covers(Gas::new(100, 5)));
        assert!(!gas.covers(Gas::new(101, 0)));
        assert!(!gas.covers(Gas::new(0, 6)));
    }

    #[test]
    fn staticness_is_inherited() {
        let top = ExecutionEnvironment {
            address: U256::from(1),
            ..Default::default()
        };
        let static_child = top.nested_static(U256::from(2), vec![], 0);
        assert!(static_child.is_static_call);

        // A regular call nested under a static frame stays static.
        let grandchild = static_child.nested(U256::from(3), vec![], 0);
        assert!(grandchild.is_static_call);
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.sender, U256::from(2));
    }
}
