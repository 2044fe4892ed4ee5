fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    // Integration tests define builtin extensions and look them up in their
    // own executable.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("linux") {
        println!("cargo:rustc-link-arg-tests=-Wl,--export-dynamic");
    }
}
