fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::compile_protos("proto/token.proto")?;
    println!("cargo:rerun-if-changed=proto/token.proto");
    Ok(())
}
