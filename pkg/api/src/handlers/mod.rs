pub mod compliance;
pub mod grants;
pub mod health;
pub mod policies;
pub mod query;
pub mod watch;
