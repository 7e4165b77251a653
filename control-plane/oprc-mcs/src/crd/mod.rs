pub mod service_import;
