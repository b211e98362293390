pub mod payee_reader;
pub mod report_writer;
