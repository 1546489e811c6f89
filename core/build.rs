fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    // build_transport(false): the service has an rpc named Connect,
    // which would collide with the generated transport constructor.
    tonic_build::configure()
        .build_transport(false)
        .compile_protos(&["proto/control.proto"], &["proto"])?;
    Ok(())
}
