fn main() {
    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager silently refuses to scan (state stays "unauthorised")
    // unless the binary carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription. For CLI tools the plist goes into
    // the Mach-O `__TEXT,__info_plist` section via the linker `-sectcreate`
    // flag; macOS reads it exactly like an App Bundle's Info.plist.
    //
    // `CARGO_CFG_TARGET_OS` reflects the *target*, so cross-compiling from
    // Linux to macOS is handled too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let dir = std::env::var("CARGO_MANIFEST_DIR")
            .expect("CARGO_MANIFEST_DIR must be set by Cargo");

        println!("cargo:rustc-link-arg=-sectcreate");
        println!("cargo:rustc-link-arg=__TEXT");
        println!("cargo:rustc-link-arg=__info_plist");
        println!("cargo:rustc-link-arg={dir}/Info.plist");

        println!("cargo:rerun-if-changed=Info.plist");
    }
}
