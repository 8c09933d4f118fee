fn main() {
    // ESP-IDF environment is only needed when cross-compiling for the chip.
    if let Ok(target) = std::env::var("TARGET") {
        if target.contains("xtensa") || target.contains("espidf") {
            embuild::espidf::sysenv::output();
        }
    }
}
