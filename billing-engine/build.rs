fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("billing_engine_descriptor.bin"))
        .compile_protos(
            &["../proto/billing/engine/v1/billing_engine.proto"],
            &["../proto"],
        )?;

    println!("cargo:rerun-if-changed=../proto/billing/engine/v1/billing_engine.proto");

    Ok(())
}
