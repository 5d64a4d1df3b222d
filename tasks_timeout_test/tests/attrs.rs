use std::{error::Error, panic, time::Duration};
use tasks_timeout::timeout;
use tasks_timeout_test::{finished_count, hold_tracked, init};

#[test]
#[timeout(5000)]
fn test_finishes_in_time() {
    init();
}

#[test]
#[timeout(ms = 5000)]
fn test_hold_finishes_in_time() {
    assert!(!hold_tracked("in_time", Duration::from_millis(20)));
    assert!(finished_count() >= 1);
}

#[test]
#[should_panic(expected = "test timed out after 50 ms")]
#[timeout(50)]
fn test_sleep_times_out() {
    init();
    std::thread::sleep(Duration::from_secs(1));
}

#[test]
#[should_panic(expected = "test timed out after 1000 ms")]
#[timeout(secs = 1)]
fn test_seconds_time_out() {
    init();
    std::thread::sleep(Duration::from_secs(3));
}

#[test]
#[should_panic(expected = "timed out")]
#[timeout(50, cancel_on_timeout)]
fn test_cancelled_hold_times_out() {
    hold_tracked("cancelled_attr_hold", Duration::from_secs(2));
}

#[test]
#[should_panic(expected = "from the test body")]
#[timeout(5000)]
fn test_panics_pass_through() {
    init();
    panic!("from the test body");
}

#[test]
#[timeout(5000)]
fn test_errors_pass_through() -> Result<(), String> {
    init();
    let inner = || -> Result<u8, String> { Err("inner".to_string()) };
    assert_eq!(inner(), Err("inner".to_string()));
    Ok(())
}

#[test]
#[timeout(5000)]
#[allow(unused_variables)]
fn test_other_attributes_are_kept() {
    let unused = 42;
}

#[test]
#[timeout(5000)]
fn test_boxed_error_return() -> Result<(), Box<dyn Error>> {
    init();
    let parsed: u32 = "42".parse()?;
    assert_eq!(parsed, 42);
    Ok(())
}

#[timeout(5000)]
fn fails_with_boxed_error() -> Result<(), Box<dyn Error>> {
    Err("no such widget".into())
}

#[test]
fn test_boxed_error_is_reported() {
    init();
    let payload = panic::catch_unwind(fails_with_boxed_error).unwrap_err();
    let message = payload.downcast_ref::<String>().unwrap();
    assert!(message.starts_with("Error: "), "{}", message);
    assert!(message.contains("no such widget"), "{}", message);
}

#[test]
#[should_panic(expected = "while running `test_dump_is_in_the_message`")]
#[timeout(50)]
fn test_dump_is_in_the_message() {
    hold_tracked("named_in_dump", Duration::from_secs(1));
}
