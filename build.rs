fn main() -> std::io::Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        unsafe {
            std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
        }
    }
    prost_build::compile_protos(&["proto/catalog.proto"], &["proto"])
}
