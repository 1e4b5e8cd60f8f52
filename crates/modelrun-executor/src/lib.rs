//! SQL executor interface
//!
//! modelrun never talks to a warehouse itself. Every materialization and
//! every assertion query goes through a `SqlExecutor`, handed the run-wide
//! `TargetConfig` explicitly.
//!
//! ## Executors
//!
//! - `MockExecutor` - scripted outcomes for tests and demos
//! - `DryRunExecutor` - records (and optionally writes) the SQL it is given;
//!   every statement succeeds with zero rows
//!
//! ## Example
//!
//! ```rust,ignore
//! use modelrun_executor::{MockExecutorBuilder, SqlExecutor};
//!
//! let executor = MockExecutorBuilder::new()
//!     .with_unit_failure("stg_lineitem", "relation does not exist")
//!     .with_row_count("unique_stg_orders_o_orderkey", 2)
//!     .build();
//! ```

pub mod executor;
pub mod mock;
pub mod dry_run;

pub use executor::{SqlExecutor, MaterializeRequest, Statement, QueryOutcome, ExecutorError};
pub use mock::{MockExecutor, MockExecutorBuilder, ExecutorCall};
pub use dry_run::DryRunExecutor;
