//! Coordination between checker nodes.
//!
//! Nodes of the checker fleet split the monitored entities with a consistent
//! hash ring built from the alive fleet members ([`dispatcher`]). Heartbeat
//! records travel between nodes over persistent framed TCP streams
//! ([`internode`]), and the leader-based checker follows the outcome of an
//! external election ([`leader`]).
//!
//! No state is shared through a database: every node derives the same ring
//! from the same fleet view, so assignments agree without a round of
//! messages.

pub mod continuum;
pub mod dispatcher;
pub mod internode;
pub mod leader;
pub mod network;
