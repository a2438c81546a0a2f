fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The issuance service is a single unary RPC; describe it by hand so the
    // build does not need protoc. Messages live in src/proto.rs.
    let create_certificate = tonic_build::manual::Method::builder()
        .name("create_certificate")
        .route_name("CreateCertificate")
        .input_type("crate::proto::IstioCertificateRequest")
        .output_type("crate::proto::IstioCertificateResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("IstioCertificateService")
        .package("istio.v1.auth")
        .method(create_certificate)
        .build();

    tonic_build::manual::Builder::new()
        .build_client(true)
        .build_server(true)
        .compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");

    Ok(())
}
