pub mod api_keys;
pub mod providers;
pub mod request_logs;
pub mod sessions;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use providers::Entity as Providers;
pub use request_logs::Entity as RequestLogs;
pub use sessions::Entity as Sessions;
pub use users::Entity as Users;
