pub mod db;
pub mod gateway;
pub mod mysql;
pub mod pipeline;
pub mod record;
pub mod settings;
pub mod source;
pub mod types;
