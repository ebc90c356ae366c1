fn main() -> Result<(), Box<dyn std::error::Error>> {
    // protox compiles the proto in-process, so no protoc install is needed
    let file_descriptors = protox::compile(["proto/exec.proto"], ["proto"])?;
    tonic_build::configure()
        .build_client(true)
        .build_server(true)
        .compile_fds(file_descriptors)?;
    println!("cargo:rerun-if-changed=proto/exec.proto");
    Ok(())
}
