fn main() {
    ::capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/common.capnp")
        .file("schema/agent.capnp")
        .file("schema/orchestrator.capnp")
        .run()
        .expect("compiling schema");
}
