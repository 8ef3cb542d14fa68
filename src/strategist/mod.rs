//! Strategist: value-table policy with ε-greedy selection and TD updates.
//!
//! Submodules:
//! - `features`: discretizes workload context into canonical state keys
//! - `value_table`: sparse (state, action) → value storage
//! - `policy`: ε-greedy recommendation, Bellman update, ε decay
//! - `reward`: scalar reward from observed outcomes
//! - `snapshot`: content-addressed canonical-JSON persistence

pub mod features;
pub mod policy;
pub mod reward;
pub mod snapshot;
pub mod value_table;

pub use features::featurize;
pub use policy::{Recommendation, Strategist, StrategistConfig, StrategistStats};
pub use reward::{compute_reward, explain_reward};
pub use snapshot::Snapshot;
pub use value_table::ValueTable;
