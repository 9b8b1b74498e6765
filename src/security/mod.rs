pub mod crypto;
pub mod secret_file;
