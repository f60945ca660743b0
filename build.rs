fn main() {
    #[cfg(windows)]
    {
        use std::env;
        use std::path::PathBuf;

        let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
        let ico_path = PathBuf::from(&manifest_dir).join("resources").join("evs.ico");
        println!("cargo:rerun-if-changed={}", ico_path.display());

        // ICO 파일이 있으면 사용, 없으면 경고만
        if ico_path.exists() {
            let mut res = winres::WindowsResource::new();
            res.set_icon(&ico_path.to_string_lossy());

            if let Err(e) = res.compile() {
                println!("cargo:warning=Failed to compile resources: {}", e);
            }
        } else {
            println!(
                "cargo:warning=Icon file not found, place evs.ico in the resources directory"
            );
        }
    }
}
