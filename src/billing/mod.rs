pub mod models;
pub mod scheduler;
pub mod service;

pub use models::{BillingItem, BillingReport};
pub use scheduler::{spawn as spawn_maintenance_scheduler, ExpiredUpload};
pub use service::OrganizationService;
