//! Emitted flow records
//!
//! A `FlowRecord` is the immutable snapshot of a terminated accumulator plus
//! every derived statistic, ready for the output writer. Column naming
//! follows the CICFlowMeter convention; which columns appear, and in what
//! order, is configuration. The built-in list below is the default.

use std::net::IpAddr;

use chrono::{TimeZone, Utc};

use crate::core::IpProtocol;

use super::accumulator::{CloseReason, FlowAccumulator};

/// The full column registry, in default output order
pub const DEFAULT_COLUMNS: &[&str] = &[
    "Flow ID",
    "Src IP",
    "Src Port",
    "Dst IP",
    "Dst Port",
    "Protocol",
    "Timestamp",
    "Flow Duration",
    "Tot Fwd Pkts",
    "Tot Bwd Pkts",
    "TotLen Fwd Pkts",
    "TotLen Bwd Pkts",
    "Fwd Pkt Len Max",
    "Fwd Pkt Len Min",
    "Fwd Pkt Len Mean",
    "Fwd Pkt Len Std",
    "Bwd Pkt Len Max",
    "Bwd Pkt Len Min",
    "Bwd Pkt Len Mean",
    "Bwd Pkt Len Std",
    "Flow Byts/s",
    "Flow Pkts/s",
    "Flow IAT Mean",
    "Flow IAT Std",
    "Flow IAT Max",
    "Flow IAT Min",
    "Fwd IAT Tot",
    "Fwd IAT Mean",
    "Fwd IAT Std",
    "Fwd IAT Max",
    "Fwd IAT Min",
    "Bwd IAT Tot",
    "Bwd IAT Mean",
    "Bwd IAT Std",
    "Bwd IAT Max",
    "Bwd IAT Min",
    "Fwd PSH Flags",
    "Bwd PSH Flags",
    "Fwd URG Flags",
    "Bwd URG Flags",
    "Fwd Header Len",
    "Bwd Header Len",
    "Fwd Pkts/s",
    "Bwd Pkts/s",
    "Pkt Len Min",
    "Pkt Len Max",
    "Pkt Len Mean",
    "Pkt Len Std",
    "Pkt Len Var",
    "FIN Flag Cnt",
    "SYN Flag Cnt",
    "RST Flag Cnt",
    "PSH Flag Cnt",
    "ACK Flag Cnt",
    "URG Flag Cnt",
    "CWE Flag Cnt",
    "ECE Flag Cnt",
    "Down/Up Ratio",
    "Pkt Size Avg",
    "Fwd Seg Size Avg",
    "Bwd Seg Size Avg",
    "Fwd Byts/b Avg",
    "Fwd Pkts/b Avg",
    "Fwd Blk Rate Avg",
    "Bwd Byts/b Avg",
    "Bwd Pkts/b Avg",
    "Bwd Blk Rate Avg",
    "Subflow Fwd Pkts",
    "Subflow Fwd Byts",
    "Subflow Bwd Pkts",
    "Subflow Bwd Byts",
    "Init Fwd Win Byts",
    "Init Bwd Win Byts",
    "Fwd Act Data Pkts",
    "Fwd Seg Size Min",
    "Active Mean",
    "Active Std",
    "Active Max",
    "Active Min",
    "Idle Mean",
    "Idle Std",
    "Idle Max",
    "Idle Min",
];

/// One cell of an output record
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Int(u64),
    Float(f64),
}

impl std::fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnValue::Text(s) => write!(f, "{}", s),
            ColumnValue::Int(v) => write!(f, "{}", v),
            ColumnValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Immutable snapshot of a terminated flow
///
/// Times are µs; byte counts are payload bytes except the header-length
/// columns. Fields without an observation default to zero.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub flow_id: String,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: IpProtocol,
    pub first_seen_us: u64,
    pub close_reason: CloseReason,

    pub duration_us: u64,

    pub tot_fwd_pkts: u64,
    pub tot_bwd_pkts: u64,
    pub totlen_fwd_pkts: u64,
    pub totlen_bwd_pkts: u64,

    pub fwd_pkt_len_max: u64,
    pub fwd_pkt_len_min: u64,
    pub fwd_pkt_len_mean: f64,
    pub fwd_pkt_len_std: f64,
    pub bwd_pkt_len_max: u64,
    pub bwd_pkt_len_min: u64,
    pub bwd_pkt_len_mean: f64,
    pub bwd_pkt_len_std: f64,

    pub flow_byts_per_sec: f64,
    pub flow_pkts_per_sec: f64,

    pub flow_iat_mean: f64,
    pub flow_iat_std: f64,
    pub flow_iat_max: u64,
    pub flow_iat_min: u64,

    pub fwd_iat_tot: u64,
    pub fwd_iat_mean: f64,
    pub fwd_iat_std: f64,
    pub fwd_iat_max: u64,
    pub fwd_iat_min: u64,
    pub bwd_iat_tot: u64,
    pub bwd_iat_mean: f64,
    pub bwd_iat_std: f64,
    pub bwd_iat_max: u64,
    pub bwd_iat_min: u64,

    pub fwd_psh_flags: u32,
    pub bwd_psh_flags: u32,
    pub fwd_urg_flags: u32,
    pub bwd_urg_flags: u32,

    pub fwd_header_len: u64,
    pub bwd_header_len: u64,

    pub fwd_pkts_per_sec: f64,
    pub bwd_pkts_per_sec: f64,

    pub pkt_len_min: u64,
    pub pkt_len_max: u64,
    pub pkt_len_mean: f64,
    pub pkt_len_std: f64,
    pub pkt_len_var: f64,

    pub fin_flag_cnt: u32,
    pub syn_flag_cnt: u32,
    pub rst_flag_cnt: u32,
    pub psh_flag_cnt: u32,
    pub ack_flag_cnt: u32,
    pub urg_flag_cnt: u32,
    pub cwr_flag_cnt: u32,
    pub ece_flag_cnt: u32,

    pub down_up_ratio: f64,
    pub pkt_size_avg: f64,
    pub fwd_seg_size_avg: f64,
    pub bwd_seg_size_avg: f64,

    pub fwd_byts_blk_avg: f64,
    pub fwd_pkts_blk_avg: f64,
    pub fwd_blk_rate_avg: f64,
    pub bwd_byts_blk_avg: f64,
    pub bwd_pkts_blk_avg: f64,
    pub bwd_blk_rate_avg: f64,

    pub subflow_fwd_pkts: u64,
    pub subflow_fwd_byts: u64,
    pub subflow_bwd_pkts: u64,
    pub subflow_bwd_byts: u64,

    pub init_fwd_win_byts: u64,
    pub init_bwd_win_byts: u64,
    pub fwd_act_data_pkts: u64,
    pub fwd_seg_size_min: u64,

    pub active_mean: f64,
    pub active_std: f64,
    pub active_max: u64,
    pub active_min: u64,
    pub idle_mean: f64,
    pub idle_std: f64,
    pub idle_max: u64,
    pub idle_min: u64,

    /// Diagnostic, not a schema column
    pub out_of_order: u64,
}

impl FlowRecord {
    /// Snapshot a closed accumulator
    ///
    /// The accumulator must already be closed (pending bulk runs and the
    /// trailing active period flushed).
    pub fn from_accumulator(acc: &FlowAccumulator) -> Self {
        // Floor the duration so single-packet flows still have defined rates
        let duration_us = acc.duration_us();
        let duration_secs = (duration_us.max(1)) as f64 / 1_000_000.0;

        let down_up_ratio = if acc.fwd.bytes > 0 {
            acc.bwd.bytes as f64 / acc.fwd.bytes as f64
        } else {
            0.0
        };

        let subflows = acc.subflow_count.max(1) as u64;

        let fwd_bulk = &acc.fwd.bulk;
        let bwd_bulk = &acc.bwd.bulk;

        Self {
            flow_id: acc.tuple.id(),
            src_ip: acc.tuple.src_ip,
            src_port: acc.tuple.src_port,
            dst_ip: acc.tuple.dst_ip,
            dst_port: acc.tuple.dst_port,
            protocol: acc.protocol(),
            first_seen_us: acc.first_seen_us,
            close_reason: acc.close_reason().unwrap_or(CloseReason::Shutdown),

            duration_us,

            tot_fwd_pkts: acc.fwd.packets,
            tot_bwd_pkts: acc.bwd.packets,
            totlen_fwd_pkts: acc.fwd.bytes,
            totlen_bwd_pkts: acc.bwd.bytes,

            fwd_pkt_len_max: acc.fwd.len_stats.max(),
            fwd_pkt_len_min: acc.fwd.len_stats.min(),
            fwd_pkt_len_mean: acc.fwd.len_stats.mean(),
            fwd_pkt_len_std: acc.fwd.len_stats.std_dev(),
            bwd_pkt_len_max: acc.bwd.len_stats.max(),
            bwd_pkt_len_min: acc.bwd.len_stats.min(),
            bwd_pkt_len_mean: acc.bwd.len_stats.mean(),
            bwd_pkt_len_std: acc.bwd.len_stats.std_dev(),

            flow_byts_per_sec: acc.total_bytes() as f64 / duration_secs,
            flow_pkts_per_sec: acc.total_packets() as f64 / duration_secs,

            flow_iat_mean: acc.flow_iat.mean(),
            flow_iat_std: acc.flow_iat.std_dev(),
            flow_iat_max: acc.flow_iat.max(),
            flow_iat_min: acc.flow_iat.min(),

            fwd_iat_tot: acc.fwd.iat.sum(),
            fwd_iat_mean: acc.fwd.iat.mean(),
            fwd_iat_std: acc.fwd.iat.std_dev(),
            fwd_iat_max: acc.fwd.iat.max(),
            fwd_iat_min: acc.fwd.iat.min(),
            bwd_iat_tot: acc.bwd.iat.sum(),
            bwd_iat_mean: acc.bwd.iat.mean(),
            bwd_iat_std: acc.bwd.iat.std_dev(),
            bwd_iat_max: acc.bwd.iat.max(),
            bwd_iat_min: acc.bwd.iat.min(),

            fwd_psh_flags: acc.fwd.psh_flags,
            bwd_psh_flags: acc.bwd.psh_flags,
            fwd_urg_flags: acc.fwd.urg_flags,
            bwd_urg_flags: acc.bwd.urg_flags,

            fwd_header_len: acc.fwd.header_bytes,
            bwd_header_len: acc.bwd.header_bytes,

            fwd_pkts_per_sec: acc.fwd.packets as f64 / duration_secs,
            bwd_pkts_per_sec: acc.bwd.packets as f64 / duration_secs,

            pkt_len_min: acc.pkt_len.min(),
            pkt_len_max: acc.pkt_len.max(),
            pkt_len_mean: acc.pkt_len.mean(),
            pkt_len_std: acc.pkt_len.std_dev(),
            pkt_len_var: acc.pkt_len.variance(),

            fin_flag_cnt: acc.fin_count,
            syn_flag_cnt: acc.syn_count,
            rst_flag_cnt: acc.rst_count,
            psh_flag_cnt: acc.psh_count,
            ack_flag_cnt: acc.ack_count,
            urg_flag_cnt: acc.urg_count,
            cwr_flag_cnt: acc.cwr_count,
            ece_flag_cnt: acc.ece_count,

            down_up_ratio,
            pkt_size_avg: acc.pkt_len.mean(),
            fwd_seg_size_avg: acc.fwd.len_stats.mean(),
            bwd_seg_size_avg: acc.bwd.len_stats.mean(),

            fwd_byts_blk_avg: bulk_avg(fwd_bulk.bulk_bytes, fwd_bulk.bulk_count),
            fwd_pkts_blk_avg: bulk_avg(fwd_bulk.bulk_packets, fwd_bulk.bulk_count),
            fwd_blk_rate_avg: bulk_rate(fwd_bulk.bulk_bytes, fwd_bulk.bulk_duration_us),
            bwd_byts_blk_avg: bulk_avg(bwd_bulk.bulk_bytes, bwd_bulk.bulk_count),
            bwd_pkts_blk_avg: bulk_avg(bwd_bulk.bulk_packets, bwd_bulk.bulk_count),
            bwd_blk_rate_avg: bulk_rate(bwd_bulk.bulk_bytes, bwd_bulk.bulk_duration_us),

            subflow_fwd_pkts: acc.fwd.packets / subflows,
            subflow_fwd_byts: acc.fwd.bytes / subflows,
            subflow_bwd_pkts: acc.bwd.packets / subflows,
            subflow_bwd_byts: acc.bwd.bytes / subflows,

            init_fwd_win_byts: acc.fwd.init_window.unwrap_or(0) as u64,
            init_bwd_win_byts: acc.bwd.init_window.unwrap_or(0) as u64,
            fwd_act_data_pkts: acc.fwd_data_packets,
            fwd_seg_size_min: if acc.fwd.packets == 0 {
                0
            } else {
                acc.fwd_seg_size_min as u64
            },

            active_mean: acc.active.mean(),
            active_std: acc.active.std_dev(),
            active_max: acc.active.max(),
            active_min: acc.active.min(),
            idle_mean: acc.idle.mean(),
            idle_std: acc.idle.std_dev(),
            idle_max: acc.idle.max(),
            idle_min: acc.idle.min(),

            out_of_order: acc.out_of_order,
        }
    }

    /// Look up one cell by column name
    pub fn value(&self, column: &str) -> Option<ColumnValue> {
        use ColumnValue::{Float, Int, Text};

        let value = match column {
            "Flow ID" => Text(self.flow_id.clone()),
            "Src IP" => Text(self.src_ip.to_string()),
            "Src Port" => Int(self.src_port as u64),
            "Dst IP" => Text(self.dst_ip.to_string()),
            "Dst Port" => Int(self.dst_port as u64),
            "Protocol" => Int(u8::from(self.protocol) as u64),
            "Timestamp" => Text(self.timestamp()),
            "Flow Duration" => Int(self.duration_us),
            "Tot Fwd Pkts" => Int(self.tot_fwd_pkts),
            "Tot Bwd Pkts" => Int(self.tot_bwd_pkts),
            "TotLen Fwd Pkts" => Int(self.totlen_fwd_pkts),
            "TotLen Bwd Pkts" => Int(self.totlen_bwd_pkts),
            "Fwd Pkt Len Max" => Int(self.fwd_pkt_len_max),
            "Fwd Pkt Len Min" => Int(self.fwd_pkt_len_min),
            "Fwd Pkt Len Mean" => Float(self.fwd_pkt_len_mean),
            "Fwd Pkt Len Std" => Float(self.fwd_pkt_len_std),
            "Bwd Pkt Len Max" => Int(self.bwd_pkt_len_max),
            "Bwd Pkt Len Min" => Int(self.bwd_pkt_len_min),
            "Bwd Pkt Len Mean" => Float(self.bwd_pkt_len_mean),
            "Bwd Pkt Len Std" => Float(self.bwd_pkt_len_std),
            "Flow Byts/s" => Float(self.flow_byts_per_sec),
            "Flow Pkts/s" => Float(self.flow_pkts_per_sec),
            "Flow IAT Mean" => Float(self.flow_iat_mean),
            "Flow IAT Std" => Float(self.flow_iat_std),
            "Flow IAT Max" => Int(self.flow_iat_max),
            "Flow IAT Min" => Int(self.flow_iat_min),
            "Fwd IAT Tot" => Int(self.fwd_iat_tot),
            "Fwd IAT Mean" => Float(self.fwd_iat_mean),
            "Fwd IAT Std" => Float(self.fwd_iat_std),
            "Fwd IAT Max" => Int(self.fwd_iat_max),
            "Fwd IAT Min" => Int(self.fwd_iat_min),
            "Bwd IAT Tot" => Int(self.bwd_iat_tot),
            "Bwd IAT Mean" => Float(self.bwd_iat_mean),
            "Bwd IAT Std" => Float(self.bwd_iat_std),
            "Bwd IAT Max" => Int(self.bwd_iat_max),
            "Bwd IAT Min" => Int(self.bwd_iat_min),
            "Fwd PSH Flags" => Int(self.fwd_psh_flags as u64),
            "Bwd PSH Flags" => Int(self.bwd_psh_flags as u64),
            "Fwd URG Flags" => Int(self.fwd_urg_flags as u64),
            "Bwd URG Flags" => Int(self.bwd_urg_flags as u64),
            "Fwd Header Len" => Int(self.fwd_header_len),
            "Bwd Header Len" => Int(self.bwd_header_len),
            "Fwd Pkts/s" => Float(self.fwd_pkts_per_sec),
            "Bwd Pkts/s" => Float(self.bwd_pkts_per_sec),
            "Pkt Len Min" => Int(self.pkt_len_min),
            "Pkt Len Max" => Int(self.pkt_len_max),
            "Pkt Len Mean" => Float(self.pkt_len_mean),
            "Pkt Len Std" => Float(self.pkt_len_std),
            "Pkt Len Var" => Float(self.pkt_len_var),
            "FIN Flag Cnt" => Int(self.fin_flag_cnt as u64),
            "SYN Flag Cnt" => Int(self.syn_flag_cnt as u64),
            "RST Flag Cnt" => Int(self.rst_flag_cnt as u64),
            "PSH Flag Cnt" => Int(self.psh_flag_cnt as u64),
            "ACK Flag Cnt" => Int(self.ack_flag_cnt as u64),
            "URG Flag Cnt" => Int(self.urg_flag_cnt as u64),
            "CWE Flag Cnt" => Int(self.cwr_flag_cnt as u64),
            "ECE Flag Cnt" => Int(self.ece_flag_cnt as u64),
            "Down/Up Ratio" => Float(self.down_up_ratio),
            "Pkt Size Avg" => Float(self.pkt_size_avg),
            "Fwd Seg Size Avg" => Float(self.fwd_seg_size_avg),
            "Bwd Seg Size Avg" => Float(self.bwd_seg_size_avg),
            "Fwd Byts/b Avg" => Float(self.fwd_byts_blk_avg),
            "Fwd Pkts/b Avg" => Float(self.fwd_pkts_blk_avg),
            "Fwd Blk Rate Avg" => Float(self.fwd_blk_rate_avg),
            "Bwd Byts/b Avg" => Float(self.bwd_byts_blk_avg),
            "Bwd Pkts/b Avg" => Float(self.bwd_pkts_blk_avg),
            "Bwd Blk Rate Avg" => Float(self.bwd_blk_rate_avg),
            "Subflow Fwd Pkts" => Int(self.subflow_fwd_pkts),
            "Subflow Fwd Byts" => Int(self.subflow_fwd_byts),
            "Subflow Bwd Pkts" => Int(self.subflow_bwd_pkts),
            "Subflow Bwd Byts" => Int(self.subflow_bwd_byts),
            "Init Fwd Win Byts" => Int(self.init_fwd_win_byts),
            "Init Bwd Win Byts" => Int(self.init_bwd_win_byts),
            "Fwd Act Data Pkts" => Int(self.fwd_act_data_pkts),
            "Fwd Seg Size Min" => Int(self.fwd_seg_size_min),
            "Active Mean" => Float(self.active_mean),
            "Active Std" => Float(self.active_std),
            "Active Max" => Int(self.active_max),
            "Active Min" => Int(self.active_min),
            "Idle Mean" => Float(self.idle_mean),
            "Idle Std" => Float(self.idle_std),
            "Idle Max" => Int(self.idle_max),
            "Idle Min" => Int(self.idle_min),
            _ => return None,
        };
        Some(value)
    }

    /// Record timestamp column (UTC, µs precision)
    fn timestamp(&self) -> String {
        Utc.timestamp_micros(self.first_seen_us as i64)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_default()
    }

    /// One CSV line in the given column order
    pub fn csv_line(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| {
                self.value(c)
                    .unwrap_or(ColumnValue::Int(0))
                    .to_string()
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// CSV header in the given column order
pub fn header_line(columns: &[String]) -> String {
    columns.join(",")
}

/// Reject column names outside the registry
pub fn validate_columns(columns: &[String]) -> Result<(), String> {
    for col in columns {
        if !DEFAULT_COLUMNS.contains(&col.as_str()) {
            return Err(col.clone());
        }
    }
    Ok(())
}

fn bulk_avg(total: u64, bulks: u32) -> f64 {
    if bulks == 0 {
        0.0
    } else {
        total as f64 / bulks as f64
    }
}

fn bulk_rate(bytes: u64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        0.0
    } else {
        bytes as f64 / (duration_us as f64 / 1_000_000.0)
    }
}
