// Integration tests run against an in-memory broker unless marked #[ignore]
mod support;

mod connection_test;
mod consumer_flow;
