fn main() {
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        panic!("unsupported target os {:?}, KMS capture is linux only!", target_os);
    }

    println!("cargo:rerun-if-env-changed=FFMPEG_DIR");

    // Without FFMPEG_DIR the system libraries are found through pkg-config.
    if let Ok(ffmpeg_dir) = std::env::var("FFMPEG_DIR") {
        println!("cargo:rustc-link-search={}/lib/amd64", ffmpeg_dir);
        println!("cargo:rustc-link-search={}/lib", ffmpeg_dir);
    }
}
