// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-field invariants shared by every crate that mutates [`crate::chain::Chain`]
//! and [`crate::module::ModuleDescriptor`] values.
//!
//! Kept here, rather than duplicated in `modscan-chains` and `modscan-registry`,
//! so the wire types and the rules that govern them never drift apart.

use crate::chain::{Chain, ChainStep};

/// A chain/module descriptor failed a structural invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A chain was defined with zero steps.
    #[error("chain '{0}' has no steps")]
    EmptyChain(String),
    /// A chain name was empty.
    #[error("chain name must not be empty")]
    EmptyName,
    /// A module id referenced by a step is empty.
    #[error("step {0} has an empty module_id")]
    EmptyStepModuleId(usize),
}

/// Renumber `steps[i].order` to `1..=steps.len()` in their current slice
/// order, in place.
///
/// Chains are authored with whatever `order` values a client supplies (or
/// none at all); this makes the stored representation canonical before it
/// is ever handed to the executor, which relies on `order` being dense and
/// 1-based.
pub fn normalize_step_order(steps: &mut [ChainStep]) {
    for (i, step) in steps.iter_mut().enumerate() {
        step.order = (i + 1) as u32;
    }
}

/// Validate a [`Chain`] definition's structural invariants.
///
/// Does not check that referenced module ids exist or are eligible — that
/// requires the registry and is the caller's responsibility (spec §4.5:
/// "a chain may be created referencing a module id that does not yet
/// exist").
pub fn validate_chain(chain: &Chain) -> Result<(), ValidationError> {
    if chain.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if chain.steps.is_empty() {
        return Err(ValidationError::EmptyChain(chain.name.clone()));
    }
    for (i, step) in chain.steps.iter().enumerate() {
        if step.module_id.trim().is_empty() {
            return Err(ValidationError::EmptyStepModuleId(i));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(module_id: &str, order: u32) -> ChainStep {
        ChainStep {
            module_id: module_id.into(),
            order,
            parameters: serde_json::Value::Null,
            soft_fail: false,
            timeout_secs: None,
        }
    }

    #[test]
    fn normalize_makes_order_dense_and_one_based() {
        let mut steps = vec![step("a", 9), step("b", 2), step("c", 100)];
        normalize_step_order(&mut steps);
        let orders: Vec<u32> = steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn rejects_empty_name() {
        let chain = Chain {
            name: "   ".into(),
            description: String::new(),
            steps: vec![step("a", 1)],
        };
        assert_eq!(validate_chain(&chain), Err(ValidationError::EmptyName));
    }

    #[test]
    fn rejects_empty_steps() {
        let chain = Chain {
            name: "c".into(),
            description: String::new(),
            steps: vec![],
        };
        assert_eq!(
            validate_chain(&chain),
            Err(ValidationError::EmptyChain("c".into()))
        );
    }

    #[test]
    fn rejects_empty_step_module_id() {
        let chain = Chain {
            name: "c".into(),
            description: String::new(),
            steps: vec![step("", 1)],
        };
        assert_eq!(
            validate_chain(&chain),
            Err(ValidationError::EmptyStepModuleId(0))
        );
    }

    #[test]
    fn accepts_well_formed_chain() {
        let chain = Chain {
            name: "c".into(),
            description: String::new(),
            steps: vec![step("a", 1), step("b", 2)],
        };
        assert!(validate_chain(&chain).is_ok());
    }
}
