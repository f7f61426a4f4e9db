fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Shards serve this service; only the client side is needed here
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["proto/datastor.proto"], &["proto"])?;

    Ok(())
}
