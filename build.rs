use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Fall back to the bundled protoc when the host does not provide one.
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    let proto_root = PathBuf::from("proto");
    let well_known = protoc_bin_vendored::include_path()?;

    let proto_files = vec![
        proto_root.join("resourcepb/resource.proto"),
        proto_root.join("storagepb/storage.proto"),
        proto_root.join("raftpb/raft_internal.proto"),
    ];

    println!("cargo:rerun-if-changed=proto");

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_files, &[proto_root, well_known])?;

    Ok(())
}
