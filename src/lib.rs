pub mod artifact;
pub mod clock;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod notifier;
pub mod presence;
pub mod push;
pub mod server;
pub mod sweeper;
