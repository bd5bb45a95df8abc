fn main() -> Result<(), Box<dyn std::error::Error>> {
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // Compile the v1beta1 and v2 encryption-provider protos
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(
            &["proto/kms_v1beta1.proto", "proto/kms_v2.proto"],
            &["proto"],
        )?;

    Ok(())
}
