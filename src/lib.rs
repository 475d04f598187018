// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackwarden
//!
//! A declarative infrastructure reconciliation engine with federated
//! credentials and lockable, versioned state.
//!
//! ## Overview
//!
//! Stackwarden converges cloud resources toward a graph declared in YAML:
//!
//! - Exchange a workload identity token for short-lived cloud credentials
//! - Diff the declared graph against stored state and order the changes
//! - Apply independent changes concurrently, dependents strictly after
//! - Persist per-stack state under an exclusive lock with optimistic sequencing
//!
//! ## Architecture
//!
//! Every pass (`up`, `refresh`, `destroy`) runs the same lifecycle:
//!
//! 1. **Lock**: Take the stack lock in the [`state`] backend
//! 2. **Authenticate**: Obtain a federated credential from the [`credentials`] broker
//! 3. **Reconcile**: Plan and apply through the [`reconciler`]
//! 4. **Persist**: Write state back and release the lock
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing, validation and fingerprints
//! - [`credentials`]: Identity tokens, trust exchange and credential caching
//! - [`state`]: State storage backends (local, S3), locking and encryption
//! - [`provider`]: Resource type adapters and their registry
//! - [`planner`]: Diff computation, dependency ordering and plan execution
//! - [`reconciler`]: Plan, apply and refresh facade
//! - [`orchestrator`]: Lifecycle verbs
//! - [`events`]: Progress reporting
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: dev
//!   stack: create-s3-bucket
//!
//! credentials:
//!   role_arn: arn:aws:iam::123456789012:role/deployer
//!   session_name: StackwardenLocalDev
//!   region: ap-south-1
//!
//! resources:
//!   - name: test-bucket
//!     type: bucket
//!     properties:
//!       tags: { team: platform }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, Fingerprinter, ResourceSpec, StackConfig};
pub use credentials::{CredentialBroker, CredentialProvider, FederatedCredential};
pub use error::{ErrorKind, Result, WardenError};
pub use events::{LifecyclePhase, ProgressEvent, ProgressSink};
pub use orchestrator::{Orchestrator, PassReport};
pub use planner::{DiffEngine, ExecutionPlan, ExecutionResult, PlanExecutor};
pub use provider::{ProviderAdapter, ProviderRegistry};
pub use reconciler::{ReconciliationEngine, RefreshReport};
pub use state::{LocalStateStore, S3StateStore, StackState, StateStore};
