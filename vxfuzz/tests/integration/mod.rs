mod command_tests;
mod config_tests;
mod session_tests;
