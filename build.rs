use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .file_descriptor_set_path(out_dir.join("master_descriptor.bin"))
        .build_server(true)
        .build_client(true)
        .compile_protos(&["proto/master.proto"], &["proto"])?;

    Ok(())
}
