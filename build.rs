fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/ffi");

    #[cfg(feature = "generate-header")]
    if let Err(error) = header::generate() {
        panic!("dnsd.h generation failed: {error}");
    }
}

#[cfg(feature = "generate-header")]
mod header {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    pub fn generate() -> Result<(), Box<dyn std::error::Error>> {
        let crate_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
        let include_dir = crate_dir.join("include");
        fs::create_dir_all(&include_dir)?;

        let output = include_dir.join("dnsd.h");
        let generator = cbindgen::generate(&crate_dir)?;
        if generator.write_to_file(&output) {
            println!("cargo:warning=Updated {}", output.display());
        }
        Ok(())
    }
}
