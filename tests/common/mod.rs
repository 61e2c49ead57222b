#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use mandi::{
    FetchOutcome, FetchParams, Fetcher, MandiResult, Source,
    config::MandiConfig,
    error::NetworkError,
};

/// Scripted fetcher: each source pops canned outcomes in order. An
/// exhausted queue answers NotFound so optional sources (the symbol
/// master) degrade instead of retry-looping.
pub struct StubFetcher {
    responses: Mutex<HashMap<Source, VecDeque<StubResponse>>>,
    calls: Mutex<HashMap<Source, u32>>,
}

pub enum StubResponse {
    Payload(Bytes),
    NotFound,
    NetworkError,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn push(&self, source: Source, response: StubResponse) {
        self.responses
            .lock()
            .expect("stub lock")
            .entry(source)
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self, source: Source) -> u32 {
        self.calls
            .lock()
            .expect("stub lock")
            .get(&source)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, source: Source, _params: &FetchParams) -> MandiResult<FetchOutcome> {
        *self
            .calls
            .lock()
            .expect("stub lock")
            .entry(source)
            .or_default() += 1;

        let next = self
            .responses
            .lock()
            .expect("stub lock")
            .get_mut(&source)
            .and_then(VecDeque::pop_front);

        match next {
            Some(StubResponse::Payload(raw)) => Ok(FetchOutcome::Payload(raw)),
            Some(StubResponse::NotFound) | None => Ok(FetchOutcome::NotFound),
            Some(StubResponse::NetworkError) => Err(NetworkError::Transport {
                url: format!("stub://{source}"),
                msg: "connection reset".to_string(),
            }
            .into()),
        }
    }
}

/// Config rooted at a temp directory, warehouse and metrics untouched.
pub fn test_config(root: &Path) -> Arc<MandiConfig> {
    let mut config = MandiConfig::from_env().expect("env config");
    config.storage.data_dir = root.join("lake");
    config.storage.quarantine_dir = root.join("quarantine");
    Arc::new(config)
}

const NSE_COLUMNS: &str = "TradDt,BizDt,Sgmt,Src,FinInstrmTp,FinInstrmId,ISIN,TckrSymb,SctySrs,\
XpryDt,FininstrmActlXpryDt,StrkPric,OptnTp,FinInstrmNm,OpnPric,HghPric,LwPric,ClsPric,LastPric,\
PrvsClsgPric,UndrlygPric,SttlmPric,OpnIntrst,ChngInOpnIntrst,TtlTradgVol,TtlTrfVal,\
TtlNbOfTxsExctd,SsnId,NewBrdLotQty,Rmks,Rsvd1,Rsvd2,Rsvd3,Rsvd4";

/// One NSE bhavcopy row with internally consistent OHLC and turnover.
pub fn nse_row(symbol: &str, id: &str, isin: &str, o: f64, h: f64, l: f64, c: f64) -> String {
    format!(
        "2024-01-15,2024-01-15,CM,NSE,STK,{id},{isin},{symbol},EQ,-,-,-,-,{symbol} LTD,\
         {o},{h},{l},{c},{c},{o},-,{c},0,0,1000,{t},50,F1,1,-,-,-,-,-",
        t = c * 1000.0,
    )
}

pub fn nse_csv(rows: &[String]) -> Bytes {
    Bytes::from(format!("{NSE_COLUMNS}\n{}\n", rows.join("\n")))
}

pub fn nse_three_symbol_fixture() -> Bytes {
    nse_csv(&[
        nse_row("RELIANCE", "2885", "INE002A01018", 2900.0, 2950.0, 2880.0, 2940.0),
        nse_row("TCS", "11536", "INE467B01029", 3800.0, 3850.0, 3790.0, 3830.0),
        nse_row("INFY", "1594", "INE009A01021", 1600.0, 1625.0, 1595.0, 1620.0),
    ])
}

const BSE_COLUMNS: &str = "SC_CODE,SC_NAME,SC_GROUP,SC_TYPE,OPEN,HIGH,LOW,CLOSE,LAST,PREVCLOSE,\
NO_TRADES,NO_OF_SHRS,NET_TURNOV,TDCLOINDI,ISIN_CODE";

pub fn bse_row(code: &str, name: &str, isin: &str, close: f64) -> String {
    let open = close - 5.0;
    format!(
        "{code},{name},A,Q,{open},{high},{low},{close},{close},{open},40,900,{t},,{isin}",
        high = close + 10.0,
        low = open - 5.0,
        t = close * 900.0,
    )
}

pub fn bse_csv(rows: &[String]) -> Bytes {
    Bytes::from(format!("{BSE_COLUMNS}\n{}\n", rows.join("\n")))
}
