//! Shared fixture: an in-process diver over the simulated runtime

#![allow(dead_code)]

use diver_agent::runtime::sim::{SimRuntime, TypeBuilder};
use diver_agent::runtime::{ManagedRuntime, ObjectId, ObjectRef, Value};
use diver_agent::{Diver, DiverConfig, DiverServer};
use diver_client::{ClientConfig, DiverClient, RetryConfig};
use diver_common::ipc::CallbackInvocationRequest;
use diver_common::{ProcessId, RemoteHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub struct TestDiver {
    pub rt: Arc<SimRuntime>,
    pub diver: Arc<Diver>,
    pub addr: SocketAddr,
    pub server: JoinHandle<diver_common::Result<()>>,
}

impl TestDiver {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn client_config(&self, pid: ProcessId) -> ClientConfig {
        let mut config = ClientConfig::with_port(self.port()).with_pid(pid);
        config.timeout_ms = 5000;
        config.retry = RetryConfig::none();
        config.heartbeat.enabled = false;
        config
    }

    pub async fn connect(&self, pid: ProcessId) -> DiverClient {
        DiverClient::open(self.client_config(pid)).await.unwrap()
    }

    /// Runtime identity behind a handle
    pub fn object_id(&self, handle: &RemoteHandle) -> ObjectId {
        self.rt.object_at(handle.address).unwrap().object.id
    }

    /// Run a method the way target code would, outside any diver request
    pub fn call_in_target(&self, target: &RemoteHandle, method: &str, args: Vec<Value>) {
        let id = self.object_id(target);
        self.rt
            .invoke(Some(id), &target.type_name, method, &[], args)
            .unwrap();
    }
}

fn field_i64(rt: &SimRuntime, this: ObjectId, field: &str) -> diver_common::Result<i64> {
    Ok(rt
        .get_field(Some(this), "Game.Enemy", field)?
        .as_primitive()
        .and_then(|p| p.as_i64())
        .unwrap_or(0))
}

pub fn game_runtime() -> Arc<SimRuntime> {
    let rt = Arc::new(SimRuntime::new());
    rt.define_type(
        TypeBuilder::new("Game", "Game.Enemy")
            .field("Name", "string")
            .field("Hp", "int")
            .field("Target", "Game.Enemy")
            .constructor(&[("name", "string"), ("hp", "int")], |rt, frame| {
                let this = frame.this()?.id;
                rt.set_field(Some(this), "Game.Enemy", "Name", frame.arg(0)?.clone())?;
                rt.set_field(Some(this), "Game.Enemy", "Hp", frame.arg(1)?.clone())?;
                Ok(None)
            })
            .event("Died", &["string"])
            .method("Hit", "int", &[("damage", "int")], |rt, frame| {
                let this = frame.this()?.id;
                let left = field_i64(rt, this, "Hp")? - frame.int_arg(0)?;
                rt.set_field(Some(this), "Game.Enemy", "Hp", Value::from(left))?;
                Ok(Some(Value::from(left)))
            })
            .method("Kill", "void", &[], |rt, frame| {
                let this = frame.this()?.id;
                let name = rt.get_field(Some(this), "Game.Enemy", "Name")?;
                rt.set_field(Some(this), "Game.Enemy", "Hp", Value::from(0))?;
                rt.raise_event(this, "Died", &[name])?;
                Ok(None)
            })
            .method("Explode", "void", &[], |_, _| {
                Err(SimRuntime::throw("Enemy exploded"))
            }),
    );
    rt.define_type(TypeBuilder::new("Game", "Game.EnemyList").collection_of("Game.Enemy"));
    rt.define_type(
        TypeBuilder::new("Game", "Game.World")
            .static_field("Enemies", "Game.EnemyList", Value::Null)
            .static_method(
                "Spawn",
                "Game.Enemy",
                &[("name", "string"), ("hp", "int")],
                |rt, frame| {
                    let enemy = rt.create_object(
                        "Game.Enemy",
                        vec![frame.arg(0)?.clone(), frame.arg(1)?.clone()],
                    )?;
                    Ok(Some(Value::Object(enemy)))
                },
            ),
    );
    rt
}

/// Fill `Game.World.Enemies` with `(name, hp)` pairs, in order
pub fn populate_world(rt: &SimRuntime, enemies: &[(&str, i64)]) -> Vec<ObjectRef> {
    let list = rt.new_object("Game.EnemyList").unwrap();
    rt.set_field(None, "Game.World", "Enemies", Value::Object(list.clone()))
        .unwrap();
    enemies
        .iter()
        .map(|(name, hp)| {
            let enemy = rt
                .create_object("Game.Enemy", vec![Value::from(*name), Value::from(*hp)])
                .unwrap();
            rt.push_item(list.id, Value::Object(enemy.clone())).unwrap();
            enemy
        })
        .collect()
}

pub async fn start_diver_with(rt: Arc<SimRuntime>, config: DiverConfig) -> TestDiver {
    let diver = Arc::new(Diver::new(rt.clone(), config).unwrap());
    let server = DiverServer::bind(diver.clone()).await.unwrap();
    let addr = server.local_addr().unwrap();
    TestDiver {
        rt,
        diver,
        addr,
        server: tokio::spawn(server.run()),
    }
}

pub async fn start_diver() -> TestDiver {
    start_diver_with(game_runtime(), DiverConfig::with_port(0)).await
}

pub async fn next_push(rx: &mut UnboundedReceiver<CallbackInvocationRequest>) -> CallbackInvocationRequest {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no callback within 5s")
        .expect("callback channel closed")
}

/// Give the dispatcher time to deliver anything it was going to, then
/// check nothing arrived
pub async fn assert_no_push(rx: &mut UnboundedReceiver<CallbackInvocationRequest>) {
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "unexpected callback");
}

pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
