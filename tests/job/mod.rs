//! Job composition tests.

mod runner_test;
