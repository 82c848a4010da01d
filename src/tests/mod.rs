pub mod jitter_buffer_tests;
pub mod signaling_tests;
pub mod transport_tests;
