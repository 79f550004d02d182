#![allow(dead_code)]

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use coven::cluster::communication::message::SystemMessage;
use coven::cluster::communication::serialize::ClusterData;
use coven::cluster::error::*;
use coven::cluster::executable::{Executor, Service};
use coven::cluster::threadpool;

/// The operations our little calculator cluster understands.
#[derive(Clone, Serialize, Deserialize)]
pub enum CalcOp {
    Double(i64),
    Sum(i64, i64),
}

pub struct CalcData;

impl ClusterData for CalcData {
    type Operation = CalcOp;
    type Value = i64;

    fn serialize_message<W: Write>(w: W, m: &SystemMessage<CalcOp, i64>) -> Result<()> {
        bincode::serialize_into(w, m).wrapped(ErrorKind::CommunicationSerialize)
    }

    fn deserialize_message<R: Read>(r: R) -> Result<SystemMessage<CalcOp, i64>> {
        bincode::deserialize_from(r).wrapped(ErrorKind::CommunicationSerialize)
    }
}

pub struct CalcService;

impl Service for CalcService {
    type Data = CalcData;

    fn execute(&self, op: CalcOp) -> Result<i64> {
        match op {
            CalcOp::Double(v) => Ok(v * 2),
            CalcOp::Sum(lo, hi) => Ok((lo..=hi).sum()),
        }
    }
}

pub fn calc_executor() -> Executor<CalcData> {
    let pool = threadpool::Builder::new().num_threads(2).build();
    Executor::new(CalcService, pool)
}
