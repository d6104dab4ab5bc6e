//! Scenario tests for the update engine, driven by scripted collaborators.


mod master_entry_test;
mod queue_test;
mod service_test;
mod upgrade_test;
