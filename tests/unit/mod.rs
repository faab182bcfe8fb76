//! Unit test modules.

mod ftms_parser_test;
mod workout_parser_test;
