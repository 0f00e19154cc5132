use std::env;

fn main() {
    // esp-idf-sys link arguments, device builds only.
    if env::var("CARGO_FEATURE_ESP32").is_ok() {
        embuild::espidf::sysenv::output();
    }
}
