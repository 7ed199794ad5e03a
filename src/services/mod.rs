mod account_service;
mod errors;
#[cfg(test)]
mod tests;

pub use account_service::AccountService;
pub use errors::ServiceError;
