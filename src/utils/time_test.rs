use std::thread::sleep;

use super::time::now_millis;
use super::time::now_secs;
use super::new_trace_id;

#[test]
fn test_now_millis() {
    let t1 = now_millis();
    sleep(std::time::Duration::from_millis(10));
    let t2 = now_millis();

    assert!(t2 > t1);
}

#[test]
fn test_now_secs() {
    assert!(now_secs() > 1_609_459_200); // Greater than 2021-01-01
}

#[test]
fn trace_ids_are_unique() {
    assert_ne!(new_trace_id(), new_trace_id());
}
