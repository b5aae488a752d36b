mod token_file;

pub use token_file::{StorageError, TokenFile, TokenRecord};
