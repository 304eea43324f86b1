//! Screen state verification: dump parsing and the expected-screen checker.

pub mod checker;
pub mod tree;

pub use checker::{AppScreenChecker, CheckOutcome, ScreenCheck};
pub use tree::{ScreenTree, build_tree, matches_path};
