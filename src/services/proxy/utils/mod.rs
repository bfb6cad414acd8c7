pub mod body;
pub mod error_responses;
