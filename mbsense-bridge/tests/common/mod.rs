//! In-process Modbus TCP device used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_modbus::prelude::*;
use tokio_modbus::server::tcp::Server;

/// Addresses at or above this limit answer `IllegalDataAddress`.
pub const ADDRESS_LIMIT: u16 = 1000;

#[derive(Clone, Default)]
pub struct Registers {
    pub holding: Arc<Mutex<HashMap<u16, u16>>>,
    pub input: Arc<Mutex<HashMap<u16, u16>>>,
    pub coils: Arc<Mutex<HashMap<u16, bool>>>,
    pub discrete: Arc<Mutex<HashMap<u16, bool>>>,
    pub requests: Arc<AtomicUsize>,
    pub in_flight: Arc<AtomicUsize>,
    pub max_in_flight: Arc<AtomicUsize>,
    /// Delay before each reply, in milliseconds.
    pub delay_ms: Arc<AtomicU64>,
}

fn read<T: Copy + Default>(
    map: &HashMap<u16, T>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<T>, ExceptionCode> {
    if u32::from(addr) + u32::from(cnt) > u32::from(ADDRESS_LIMIT) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok((addr..addr + cnt)
        .map(|a| map.get(&a).copied().unwrap_or_default())
        .collect())
}

fn write<T: Copy>(map: &mut HashMap<u16, T>, addr: u16, values: &[T]) -> Result<(), ExceptionCode> {
    if u32::from(addr) + values.len() as u32 > u32::from(ADDRESS_LIMIT) {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    for (i, value) in values.iter().enumerate() {
        map.insert(addr + i as u16, *value);
    }
    Ok(())
}

impl tokio_modbus::server::Service for Registers {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Exception>> + Send>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let registers = self.clone();
        Box::pin(async move {
            let now = registers.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            registers.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let delay = registers.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let res = registers.apply(req);
            registers.in_flight.fetch_sub(1, Ordering::SeqCst);
            res
        })
    }
}

impl Registers {
    fn apply(&self, req: Request<'static>) -> Result<Response, ExceptionCode> {
        match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                read(&*self.holding.lock().unwrap(), addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                read(&*self.input.lock().unwrap(), addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadCoils(addr, cnt) => {
                read(&*self.coils.lock().unwrap(), addr, cnt).map(Response::ReadCoils)
            }
            Request::ReadDiscreteInputs(addr, cnt) => {
                read(&*self.discrete.lock().unwrap(), addr, cnt).map(Response::ReadDiscreteInputs)
            }
            Request::WriteSingleRegister(addr, value) => {
                write(&mut *self.holding.lock().unwrap(), addr, &[value])
                    .map(|_| Response::WriteSingleRegister(addr, value))
            }
            Request::WriteMultipleRegisters(addr, values) => {
                write(&mut *self.holding.lock().unwrap(), addr, &values[..])
                    .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16))
            }
            Request::WriteSingleCoil(addr, value) => {
                write(&mut *self.coils.lock().unwrap(), addr, &[value])
                    .map(|_| Response::WriteSingleCoil(addr, value))
            }
            Request::WriteMultipleCoils(addr, values) => {
                write(&mut *self.coils.lock().unwrap(), addr, &values[..])
                    .map(|_| Response::WriteMultipleCoils(addr, values.len() as u16))
            }
            // Report server id is not implemented, like many real devices.
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    pub fn set_holding(&self, addr: u16, values: &[u16]) {
        let mut map = self.holding.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            map.insert(addr + i as u16, *v);
        }
    }

    pub fn set_input(&self, addr: u16, values: &[u16]) {
        let mut map = self.input.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            map.insert(addr + i as u16, *v);
        }
    }

    pub fn set_coils(&self, addr: u16, values: &[bool]) {
        let mut map = self.coils.lock().unwrap();
        for (i, v) in values.iter().enumerate() {
            map.insert(addr + i as u16, *v);
        }
    }

    pub fn holding(&self, addr: u16) -> u16 {
        self.holding.lock().unwrap().get(&addr).copied().unwrap_or_default()
    }

    pub fn coil(&self, addr: u16) -> bool {
        self.coils.lock().unwrap().get(&addr).copied().unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// A running emulated device.
///
/// Client connections are relayed through tasks owned by the device, so
/// stopping it closes every open socket like a powered-off device would.
pub struct Device {
    pub addr: SocketAddr,
    pub registers: Registers,
    task: JoinHandle<()>,
    relays: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Device {
    pub async fn start() -> Self {
        Self::serve("127.0.0.1:0".parse().unwrap(), Registers::default()).await
    }

    /// Start again on the address of a stopped device, keeping its registers.
    pub async fn restart(addr: SocketAddr, registers: Registers) -> Self {
        Self::serve(addr, registers).await
    }

    async fn serve(addr: SocketAddr, registers: Registers) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(listener);
        let relays = Arc::new(Mutex::new(Vec::new()));

        let service = registers.clone();
        let tracked = Arc::clone(&relays);
        let on_connected = move |stream: TcpStream, _: SocketAddr| {
            let service = service.clone();
            let (mut outer, inner) = tokio::io::duplex(4096);
            let relay = tokio::spawn(async move {
                let mut stream = stream;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut outer).await;
            });
            tracked.lock().unwrap().push(relay);
            async move { Ok::<_, std::io::Error>(Some((service, inner))) }
        };
        let on_process_error = |err| {
            eprintln!("emulator error: {err}");
        };

        let task = tokio::spawn(async move {
            let _ = server.serve(&on_connected, on_process_error).await;
        });

        Self {
            addr,
            registers,
            task,
            relays,
        }
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Stop listening and drop every client connection.
    pub fn stop(&self) {
        self.task.abort();
        for relay in self.relays.lock().unwrap().drain(..) {
            relay.abort();
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A device that accepts connections and never answers.
pub struct Silent {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Silent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });
        Self {
            addr,
            accepted,
            task,
        }
    }

    pub fn uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for Silent {
    fn drop(&mut self) {
        self.task.abort();
    }
}
