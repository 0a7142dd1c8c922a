pub mod dispatcher;
pub mod import;
pub mod module;
pub mod numeric;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod value;
pub mod wasi;
