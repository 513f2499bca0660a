#[allow(clippy::all, clippy::pedantic, warnings)]
pub mod common_capnp {
    include!(concat!(env!("OUT_DIR"), "/common_capnp.rs"));
}

#[allow(clippy::all, clippy::pedantic, warnings)]
pub mod agent_capnp {
    include!(concat!(env!("OUT_DIR"), "/agent_capnp.rs"));
}

#[allow(clippy::all, clippy::pedantic, warnings)]
pub mod orchestrator_capnp {
    include!(concat!(env!("OUT_DIR"), "/orchestrator_capnp.rs"));
}
