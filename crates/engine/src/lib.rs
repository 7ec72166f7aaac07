pub mod counter;
pub mod delivery;
pub mod dispatcher;
pub mod fanout;
pub mod lifecycle;
pub mod reconcile;
pub mod registry;
pub mod service;
pub mod settings;
pub mod store;

pub use service::NotificationService;
