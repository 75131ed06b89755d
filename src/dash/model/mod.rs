pub mod record;
pub mod token;
pub mod vehicle;
