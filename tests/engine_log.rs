//! The log sink is process-global state, so this file holds exactly one test
//! that walks the whole register / clear / replace lifecycle in order.

use std::ffi::c_int;
use std::sync::Mutex;

use tiered_kv::{clear_log_callback, register_log_callback};

static MESSAGES: Mutex<Vec<(i32, String)>> = Mutex::new(Vec::new());
static REPLACEMENT_MESSAGES: Mutex<Vec<(i32, String)>> = Mutex::new(Vec::new());

fn capture(code: c_int, message: &str) {
    MESSAGES
        .lock()
        .expect("log capture mutex")
        .push((code, message.to_owned()));
}

fn capture_replacement(code: c_int, message: &str) {
    REPLACEMENT_MESSAGES
        .lock()
        .expect("log capture mutex")
        .push((code, message.to_owned()));
}

#[test]
fn log_callback_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    register_log_callback(capture)?;

    rusqlite::trace::log(1, "sink installed");
    {
        let messages = MESSAGES.lock().expect("log capture mutex");
        assert!(
            messages
                .iter()
                .any(|(code, msg)| *code == 1 && msg.contains("sink installed")),
            "registered callback should receive engine log events"
        );
    }

    // A cleared sink receives nothing further.
    clear_log_callback()?;
    let before = MESSAGES.lock().expect("log capture mutex").len();
    rusqlite::trace::log(1, "after clear");
    assert_eq!(MESSAGES.lock().expect("log capture mutex").len(), before);

    // The engine accepts reconfiguration even with a live connection; the
    // replacement sink receives subsequent events and the old one stays quiet.
    let conn = rusqlite::Connection::open_in_memory()?;
    register_log_callback(capture_replacement)?;
    rusqlite::trace::log(2, "sink replaced");
    {
        let replacement = REPLACEMENT_MESSAGES.lock().expect("log capture mutex");
        assert!(
            replacement
                .iter()
                .any(|(code, msg)| *code == 2 && msg.contains("sink replaced")),
            "replacement callback should receive engine log events"
        );
    }
    assert_eq!(MESSAGES.lock().expect("log capture mutex").len(), before);
    drop(conn);

    clear_log_callback()?;
    Ok(())
}
