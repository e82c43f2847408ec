//! # Shardline
//! Routing and scatter-gather over partitioned clusters whose membership is
//! recorded in a coordination service.
//!
//! This is a convenience package which includes all of the sub-projects within
//! Shardline, realistically you probably only want some of these projects:
//!
//! ### Features
//! - `shardline_coord` - The coordination service boundary and an in-memory registry.
//! - `shardline_cluster` - Live, partitioned cluster views and the cluster manager.
//! - `shardline_routing` - Routing algorithms and the scatter-gather engine.

#[cfg(feature = "shardline-cluster")]
pub use shardline_cluster as cluster;
#[cfg(feature = "shardline-coord")]
pub use shardline_coord as coord;
#[cfg(feature = "shardline-routing")]
pub use shardline_routing as routing;
