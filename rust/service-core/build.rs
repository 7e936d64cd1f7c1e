fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_dir = "../../proto";
    let proto_files = [
        "../../proto/common.proto",
        "../../proto/dispatcher.proto",
        "../../proto/worker.proto",
    ];

    // Use the vendored protoc so builds don't depend on a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    for file in &proto_files {
        println!("cargo:rerun-if-changed={file}");
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_files, &[proto_dir])?;

    Ok(())
}
