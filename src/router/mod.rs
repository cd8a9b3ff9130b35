//! Request routing: classify each intercepted request and pick its strategy.
//!
//! | class        | strategy      | partition |
//! |--------------|---------------|-----------|
//! | image        | cache-first   | image     |
//! | static asset | cache-first   | static    |
//! | api          | network-first | api       |
//! | navigation   | network-first | dynamic   |

mod classify;
mod strategy;

pub use classify::{should_intercept, Classifier, RequestClass};
pub use strategy::{NavigationFallbacks, RouteSource, Routed, Router};
