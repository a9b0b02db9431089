pub mod byte_buffer;
pub mod rolling_data;
pub mod safe_converter;
