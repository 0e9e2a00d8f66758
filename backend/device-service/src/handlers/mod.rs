pub mod devices;

pub use devices::routes;
