fn main() {
    println!("cargo:rerun-if-changed=../../proto/");

    tonic_prost_build::configure()
        .build_server(true)
        .build_client(true)
        .bytes(["."])
        .compile_protos(&["../../proto/tunnel.proto"], &["../../proto"])
        .expect("failed to compile gRPC definitions");
}
