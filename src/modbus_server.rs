//! Modbus/TCP side of the meter.
//!
//! The inverter polls the emulated meter here. Every read function (coils,
//! discrete inputs, holding and input registers) is served from the same
//! register table; writes are answered with an IllegalFunction exception.
//! Only the configured unit id is answered.

use crate::prelude::*;
use anyhow::Result;

use std::{future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use tokio_modbus::{
    prelude::*,
    server::tcp::{accept_tcp_connection, Server},
};

const MAX_READ_REGISTERS: u16 = 125;
const MAX_READ_BITS: u16 = 2000;

const GATE_LOG_INTERVAL: Duration = Duration::from_secs(10);

pub struct MeterService {
    engine: Arc<Engine>,
    unit_id: u8,
}

impl tokio_modbus::server::Service for MeterService {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let SlaveRequest { slave, request } = req;

        let res = if slave != self.unit_id {
            warn!("SERVER: request for unit {} ignored, we are unit {}", slave, self.unit_id);
            Err(ExceptionCode::GatewayTargetDevice)
        } else {
            self.handle(request)
        };

        if res.is_err() {
            self.engine.note_rejected_request();
        }
        future::ready(res)
    }
}

impl MeterService {
    pub fn new(engine: Arc<Engine>, unit_id: u8) -> Self {
        Self { engine, unit_id }
    }

    fn handle(&self, req: Request<'static>) -> Result<Response, ExceptionCode> {
        match req {
            Request::ReadHoldingRegisters(addr, cnt) => {
                self.read_words(addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::ReadInputRegisters(addr, cnt) => {
                self.read_words(addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadCoils(addr, cnt) => self.read_bits(addr, cnt).map(Response::ReadCoils),
            Request::ReadDiscreteInputs(addr, cnt) => {
                self.read_bits(addr, cnt).map(Response::ReadDiscreteInputs)
            }
            Request::WriteSingleCoil(..)
            | Request::WriteMultipleCoils(..)
            | Request::WriteSingleRegister(..)
            | Request::WriteMultipleRegisters(..)
            | Request::MaskWriteRegister(..)
            | Request::ReadWriteMultipleRegisters(..) => {
                warn!("SERVER: Exception::IllegalFunction - meter is read-only, rejected {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
            _ => {
                error!("SERVER: Exception::IllegalFunction - Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        }
    }

    fn read_words(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        if cnt == 0 || cnt > MAX_READ_REGISTERS {
            error!("SERVER: Exception::IllegalDataValue - read of {} registers", cnt);
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.read(addr, cnt)
    }

    // the meter has no bit storage, a bit reads as set when its register is non-zero
    fn read_bits(&self, addr: u16, cnt: u16) -> Result<Vec<bool>, ExceptionCode> {
        if cnt == 0 || cnt > MAX_READ_BITS {
            error!("SERVER: Exception::IllegalDataValue - read of {} bits", cnt);
            return Err(ExceptionCode::IllegalDataValue);
        }
        self.read(addr, cnt)
            .map(|words| words.into_iter().map(|w| w != 0).collect())
    }

    fn read(&self, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
        self.engine.read_registers(addr, cnt.into()).map_err(|err| {
            error!("SERVER: Exception::IllegalDataAddress - {}", err);
            ExceptionCode::IllegalDataAddress
        })
    }
}

/// Serves the register table once the engine has real data.
pub struct PollingResponder {
    engine: Arc<Engine>,
    unit_id: u8,
}

impl PollingResponder {
    pub fn new(engine: Arc<Engine>, unit_id: u8) -> Self {
        Self { engine, unit_id }
    }

    /// Blocks until the engine is ready, then binds `addr` and serves forever.
    /// Nothing listens on `addr` before the first energy sample arrived, and
    /// the live block is encoded once before the first client can connect.
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        self.wait_for_data().await;

        if let Err(err) = self.engine.run_cycle() {
            warn!("first encoder cycle failed, live block stays empty: {}", err);
        }

        info!("data available, starting modbus server on {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| anyhow!("modbus_server.rs:cannot listen on {}: {}", addr, err))?;

        self.serve(listener).await
    }

    pub async fn wait_for_data(&self) {
        loop {
            match tokio::time::timeout(GATE_LOG_INTERVAL, self.engine.wait_ready()).await {
                Ok(()) => return,
                Err(_) => info!("waiting for energy data from MQTT broker"),
            }
        }
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let server = Server::new(listener);
        let unit_id = self.unit_id;

        let on_connected = |stream, socket_addr: SocketAddr| {
            let engine = self.engine.clone();
            async move {
                info!("modbus client connected from {}", socket_addr);
                accept_tcp_connection(stream, socket_addr, move |_socket_addr| {
                    Ok(Some(MeterService::new(engine.clone(), unit_id)))
                })
            }
        };
        let on_process_error = |err| {
            error!("modbus connection error: {}", err);
        };

        server.serve(&on_connected, on_process_error).await?;
        Ok(())
    }
}
