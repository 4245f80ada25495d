mod process_supervision_tests;
mod shared_broker_tests;
