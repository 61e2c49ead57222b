use std::{sync::Arc, time::Instant};

use bytes::Bytes;
use chrono::{Datelike, NaiveDate, Utc};
use polars::prelude::DataFrame;
use tokio::task::JoinSet;

use crate::{
    breaker::BreakerRegistry,
    config::MandiConfig,
    dedup::deduplicate,
    error::{DataError, MandiResult, SystemError},
    fetch::{DealKind, FetchOutcome, FetchParams, Fetcher, Source},
    lake::{LakeWriter, WriteReport, WriteRequest},
    metrics,
    parse::{
        ParseContext, SourceParser, bse_bar::BseBarParser, bulk_deals::BulkDealsParser,
        corporate_actions::{CorporateActionsParser, apply_adjustments},
        days_since_epoch, index_constituents::IndexConstituentParser, nse_bar::NseBarParser,
        option_chain::OptionChainParser, symbol_master::{SymbolMasterParser, enrich_with_instrument_ids},
        xbrl::XbrlFinancialsParser,
    },
    pipeline::{PipelineKind, PipelineRun, RunContext, RunStatus},
    schema::{CanonicalCol, Layer, equity_bar_schema, trading_calendar_schema},
    validate::report::AuditLog,
    warehouse::{WarehouseLoader, WarehouseTable},
};

/// Indices snapshotted by the constituents pipeline.
const TRACKED_INDICES: [&str; 2] = ["NIFTY 50", "NIFTY BANK"];

/// Underlyings snapshotted by the option-chain pipeline.
const TRACKED_UNDERLYINGS: [&str; 3] = ["NIFTY", "BANKNIFTY", "FINNIFTY"];

/// Symbols whose quarterly filings are ingested.
const TRACKED_FILERS: [&str; 3] = ["RELIANCE", "TCS", "INFY"];

/// The pipeline execution kernel: composes fetch → parse → validate →
/// write → load per source, with per-step error policy, idempotency at
/// every irreversible boundary and metrics on each arrow.
pub struct PipelineKernel {
    config: Arc<MandiConfig>,
    fetcher: Arc<dyn Fetcher>,
    breakers: Arc<BreakerRegistry>,
    writer: LakeWriter,
    loader: Option<Arc<WarehouseLoader>>,
    audit: AuditLog,
}

impl PipelineKernel {
    pub fn new(config: Arc<MandiConfig>, fetcher: Arc<dyn Fetcher>) -> Self {
        let audit = AuditLog::new(&config.storage.quarantine_dir);
        Self {
            config,
            fetcher,
            breakers: Arc::new(BreakerRegistry::new()),
            writer: LakeWriter::new().with_audit_log(audit.clone()),
            loader: None,
            audit,
        }
    }

    /// Attach the warehouse loader. Without one, runs stop after the
    /// lake write (tests and backfills into the lake only).
    pub fn with_warehouse(mut self) -> MandiResult<Self> {
        self.loader = Some(Arc::new(WarehouseLoader::from_config(
            &self.config.warehouse,
        )?));
        Ok(self)
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        self.breakers.clone()
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Run one pipeline for one trading date. Errors are folded into
    /// the returned run record; the caller inspects `status`.
    #[tracing::instrument(skip_all, fields(pipeline = kind.as_str(), trade_date = %trade_date))]
    pub async fn run(&self, kind: PipelineKind, trade_date: NaiveDate) -> PipelineRun {
        let ctx = RunContext::new(self.config.clone(), self.breakers.clone());
        ctx.spawn_deadline_watchdog();

        let mut run = PipelineRun::new(ctx.run_id, kind).with_parameter("trade_date", trade_date);
        tracing::info!(run_id = %ctx.run_id, "pipeline_run_started");

        let outcome = match kind {
            PipelineKind::EquityDaily => self.run_equity(&ctx, &mut run, trade_date).await,
            PipelineKind::CombinedEquity => self.run_combined(&ctx, &mut run, trade_date).await,
            PipelineKind::BulkBlockDeals => self.run_deals(&ctx, &mut run, trade_date).await,
            PipelineKind::IndexConstituents => {
                self.run_constituents(&ctx, &mut run, trade_date).await
            }
            PipelineKind::OptionChainSnapshot => {
                self.run_option_chain(&ctx, &mut run, trade_date).await
            }
            PipelineKind::CorporateActions => {
                self.run_corporate_actions(&ctx, &mut run, trade_date).await
            }
            PipelineKind::TradingCalendar => self.run_calendar(&ctx, &mut run, trade_date).await,
            PipelineKind::QuarterlyFinancials => {
                self.run_financials(&ctx, &mut run, trade_date).await
            }
        };

        match outcome {
            Ok(status) => run.finish(status),
            Err(e) => {
                tracing::error!(error = %e, "pipeline_run_failed");
                run.finish(RunStatus::Failed);
            }
        }
        ctx.cancel.cancel();
        run
    }

    // ============================================================================================
    // Pipelines
    // ============================================================================================

    async fn run_equity(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let params = FetchParams::for_date(trade_date);
        let raw = self
            .fetch_step(ctx, run, Source::NseEqBar, &params, "fetch:nse_eq_bar")
            .await?;

        let (df, not_found) = match raw {
            Some(raw) => {
                let pctx = ParseContext::new(Source::NseEqBar, trade_date);
                let df = self
                    .parse_step(run, NseBarParser, raw, pctx, "parse:nse_eq_bar")
                    .await?;
                (df, false)
            }
            None => (DataFrame::empty_with_schema(&equity_bar_schema()), true),
        };

        // Reprice for announced splits/bonuses; an unavailable
        // disclosure feed leaves the bars at their neutral factors.
        let df = if df.height() > 0 {
            match self.tolerant_actions_frame(ctx, trade_date).await {
                Some(actions) => apply_adjustments(df, &actions)?,
                None => df,
            }
        } else {
            df
        };

        let mut req = self
            .equity_write_request(trade_date)
            .with_file_stem(format!("bhavcopy_{}", trade_date.format("%Y%m%d")))
            .with_metadata("source", Source::NseEqBar.as_str());
        if not_found {
            req = req.with_metadata("skipped", "download_failed");
        }

        let report = self.write_step(ctx, run, &df, req, "write:equity_ohlc").await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }
        if df.height() == 0 {
            return Ok(RunStatus::Success);
        }

        self.load_step(ctx, run, &df, WarehouseTable::NormalizedEquityOhlc)
            .await
    }

    async fn run_combined(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let params = FetchParams::for_date(trade_date);

        // Both exchanges fetch concurrently; losing one source degrades
        // the run instead of failing it.
        let (nse, bse) = futures::join!(
            self.tolerant_source_frame(ctx, Source::NseEqBar, &params, trade_date),
            self.tolerant_source_frame(ctx, Source::BseEqBar, &params, trade_date),
        );
        for (source, frame) in [("NSE_EQ_BAR", &nse), ("BSE_EQ_BAR", &bse)] {
            let rows = frame.as_ref().map(DataFrame::height).unwrap_or(0) as u64;
            run.record_step(&format!("source:{source}"), rows, Default::default(), None);
            if frame.is_none() {
                tracing::warn!(source, "combined_run_degraded_source_unavailable");
            }
        }

        let started = Instant::now();
        let combined = deduplicate(vec![nse, bse], CanonicalCol::Isin)?;
        run.record_step("dedup:isin", combined.height() as u64, started.elapsed(), None);

        // Master enrichment is additive; a failed master fetch leaves
        // instrument ids as the exchanges published them.
        let combined = match self
            .tolerant_master_frame(ctx, trade_date)
            .await
        {
            Some(master) => enrich_with_instrument_ids(combined, &master)?,
            None => combined,
        };

        let combined = if combined.height() > 0 {
            match self.tolerant_actions_frame(ctx, trade_date).await {
                Some(actions) => apply_adjustments(combined, &actions)?,
                None => combined,
            }
        } else {
            combined
        };

        let req = self
            .equity_write_request(trade_date)
            .with_file_stem(format!("combined_{}", trade_date.format("%Y%m%d")))
            .with_key(format!("{trade_date}:combined"))
            .with_metadata("source", "NSE_EQ_BAR+BSE_EQ_BAR");

        let report = self
            .write_step(ctx, run, &combined, req, "write:equity_ohlc_combined")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }

        self.load_step(ctx, run, &combined, WarehouseTable::NormalizedEquityOhlc)
            .await
    }

    async fn run_deals(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let mut frames = Vec::new();
        let mut skips = 0usize;

        for deal_kind in [DealKind::Bulk, DealKind::Block] {
            let label = deal_kind.as_str().to_lowercase();
            let params = FetchParams::for_date(trade_date).with_deal_kind(deal_kind);
            let raw = self
                .fetch_step(ctx, run, Source::NseBulkDeals, &params, &format!("fetch:{label}_deals"))
                .await?;

            let df = match raw {
                Some(raw) => {
                    let pctx = ParseContext::new(Source::NseBulkDeals, trade_date);
                    self.parse_step(
                        run,
                        BulkDealsParser { deal_kind },
                        raw,
                        pctx,
                        &format!("parse:{label}_deals"),
                    )
                    .await?
                }
                None => DataFrame::empty_with_schema(&crate::schema::bulk_block_deal_schema()),
            };

            let mut req = WriteRequest::new(
                Layer::Normalized,
                "bulk_block_deals",
                &self.config.storage.data_dir,
                trade_date,
            )
            .with_partition_cols(vec![
                CanonicalCol::DealType,
                CanonicalCol::Year,
                CanonicalCol::Month,
                CanonicalCol::Day,
            ])
            .with_schema_name("bulk_block_deals")
            .with_quarantine_dir(&self.config.storage.quarantine_dir)
            .with_key(format!("{trade_date}:{}", deal_kind.as_str()))
            .with_file_stem(format!("{label}_deals_{}", trade_date.format("%Y%m%d")))
            .with_metadata("source", Source::NseBulkDeals.as_str())
            .apply_policy(&self.config.pipeline);
            if df.height() == 0 {
                req = req.with_metadata("skipped", "download_failed");
            }

            let report = self
                .write_step(ctx, run, &df, req, &format!("write:{label}_deals"))
                .await?;
            if report.idempotent_skip {
                skips += 1;
            }
            if df.height() > 0 {
                frames.push(df);
            }
        }

        if skips == 2 {
            return Ok(RunStatus::SkippedIdempotent);
        }
        let Some(mut combined) = frames.pop() else {
            return Ok(RunStatus::Success);
        };
        for frame in frames {
            combined
                .vstack_mut(&frame)
                .map_err(|e| DataError::Frame(e.to_string()))?;
        }

        self.load_step(ctx, run, &combined, WarehouseTable::BulkBlockDeals)
            .await
    }

    async fn run_constituents(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let mut combined: Option<DataFrame> = None;

        for index in TRACKED_INDICES {
            let params = FetchParams::for_date(trade_date).with_index(index);
            let raw = self
                .fetch_step(
                    ctx,
                    run,
                    Source::NseIndexConstituent,
                    &params,
                    &format!("fetch:constituents:{index}"),
                )
                .await?;
            let Some(raw) = raw else { continue };

            let pctx = ParseContext::new(Source::NseIndexConstituent, trade_date).with_index(index);
            let df = self
                .parse_step(
                    run,
                    IndexConstituentParser::default(),
                    raw,
                    pctx,
                    &format!("parse:constituents:{index}"),
                )
                .await?;

            combined = Some(match combined {
                None => df,
                Some(mut acc) => {
                    acc.vstack_mut(&df)
                        .map_err(|e| DataError::Frame(e.to_string()))?;
                    acc
                }
            });
        }

        let df = combined.unwrap_or_else(|| {
            DataFrame::empty_with_schema(&crate::schema::index_constituent_schema())
        });

        let mut req = WriteRequest::new(
            Layer::Reference,
            "index_constituents",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_schema_name("index_constituents")
        .with_quarantine_dir(&self.config.storage.quarantine_dir)
        .with_file_stem(format!("constituents_{}", trade_date.format("%Y%m%d")))
        .apply_policy(&self.config.pipeline);
        if df.height() == 0 {
            req = req.with_metadata("skipped", "download_failed");
        }

        let report = self
            .write_step(ctx, run, &df, req, "write:index_constituents")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }
        if df.height() == 0 {
            return Ok(RunStatus::Success);
        }

        self.load_step(ctx, run, &df, WarehouseTable::IndexConstituents)
            .await
    }

    /// Intraday snapshot: the tracked underlyings fetch in parallel on
    /// a bounded worker pool; one lost symbol degrades the snapshot.
    async fn run_option_chain(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let snapshot_label = Utc::now()
            .with_timezone(&chrono_tz::Asia::Kolkata)
            .format("%H%M")
            .to_string();

        let (job_tx, job_rx) = async_channel::bounded::<String>(TRACKED_UNDERLYINGS.len());
        for symbol in TRACKED_UNDERLYINGS {
            job_tx
                .send(symbol.to_string())
                .await
                .map_err(|e| SystemError::Join(e.to_string()))?;
        }
        drop(job_tx);

        let (frame_tx, mut frame_rx) =
            tokio::sync::mpsc::channel::<(String, MandiResult<Option<DataFrame>>)>(
                TRACKED_UNDERLYINGS.len(),
            );

        let workers_n = self.config.pipeline.fetch_workers.max(1);
        let mut workers: JoinSet<()> = JoinSet::new();
        for _ in 0..workers_n {
            let rx = job_rx.clone();
            let tx = frame_tx.clone();
            let fetcher = self.fetcher.clone();
            let breakers = self.breakers.clone();
            let cancel = ctx.cancel.clone();
            let date = trade_date;

            workers.spawn(async move {
                while let Ok(symbol) = rx.recv().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let source = Source::NseOptionChain;
                    let breaker = breakers.get_or_create(source.as_str(), source.breaker_config());
                    let params = FetchParams::for_date(date).with_symbol(symbol.as_str());

                    let fetched = source
                        .retry_policy()
                        .run(&format!("fetch:chain:{symbol}"), Some(&breaker), || {
                            let fetcher = fetcher.clone();
                            let params = params.clone();
                            async move { fetcher.fetch(source, &params).await }
                        })
                        .await;

                    let result = match fetched {
                        Ok(FetchOutcome::NotFound) => Ok(None),
                        Ok(FetchOutcome::Payload(raw)) => {
                            let pctx = ParseContext::new(source, date).with_symbol(symbol.as_str());
                            OptionChainParser.parse(&raw, &pctx).map(Some)
                        }
                        Err(e) => Err(e),
                    };
                    let _ = tx.send((symbol, result)).await;
                }
            });
        }
        drop(job_rx);
        drop(frame_tx);

        let mut combined: Option<DataFrame> = None;
        let mut degraded = 0usize;
        while let Some((symbol, result)) = frame_rx.recv().await {
            match result {
                Ok(Some(df)) => {
                    metrics::rows_parsed(Source::NseOptionChain.as_str(), "ok", df.height() as u64);
                    run.record_step(
                        &format!("chain:{symbol}"),
                        df.height() as u64,
                        Default::default(),
                        None,
                    );
                    combined = Some(match combined {
                        None => df,
                        Some(mut acc) => {
                            acc.vstack_mut(&df)
                                .map_err(|e| DataError::Frame(e.to_string()))?;
                            acc
                        }
                    });
                }
                Ok(None) => {
                    run.record_step(&format!("chain:{symbol}"), 0, Default::default(), None);
                }
                Err(e) => {
                    degraded += 1;
                    metrics::rows_parsed(Source::NseOptionChain.as_str(), "failed", 0);
                    tracing::warn!(symbol = %symbol, error = %e, "option_chain_symbol_degraded");
                    run.record_step(
                        &format!("chain:{symbol}"),
                        0,
                        Default::default(),
                        Some(e.to_string()),
                    );
                }
            }
        }
        while workers.join_next().await.is_some() {}

        if degraded == TRACKED_UNDERLYINGS.len() {
            return Ok(RunStatus::Failed);
        }

        let df = combined.unwrap_or_else(|| {
            DataFrame::empty_with_schema(&crate::schema::option_chain_schema())
        });

        let req = WriteRequest::new(
            Layer::Normalized,
            "option_chain",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_schema_name("option_chain")
        .with_quarantine_dir(&self.config.storage.quarantine_dir)
        .with_key(format!("{trade_date}:{snapshot_label}"))
        .with_file_stem(format!(
            "chain_{}_{snapshot_label}",
            trade_date.format("%Y%m%d")
        ))
        .apply_policy(&self.config.pipeline);

        let report = self
            .write_step(ctx, run, &df, req, "write:option_chain")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }
        if df.height() == 0 {
            return Ok(RunStatus::Success);
        }

        self.load_step(ctx, run, &df, WarehouseTable::OptionChain).await
    }

    async fn run_corporate_actions(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let params = FetchParams::for_date(trade_date);
        let raw = self
            .fetch_step(
                ctx,
                run,
                Source::NseCorporateActions,
                &params,
                "fetch:corporate_actions",
            )
            .await?;

        let df = match raw {
            Some(raw) => {
                let pctx = ParseContext::new(Source::NseCorporateActions, trade_date);
                self.parse_step(run, CorporateActionsParser, raw, pctx, "parse:corporate_actions")
                    .await?
            }
            None => DataFrame::empty_with_schema(&crate::schema::corporate_action_schema()),
        };

        let mut req = WriteRequest::new(
            Layer::Reference,
            "corporate_actions",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_schema_name("corporate_actions")
        .with_quarantine_dir(&self.config.storage.quarantine_dir)
        .with_file_stem(format!("actions_{}", trade_date.format("%Y%m%d")))
        .with_metadata("source", Source::NseCorporateActions.as_str())
        .apply_policy(&self.config.pipeline);
        if df.height() == 0 {
            req = req.with_metadata("skipped", "download_failed");
        }

        let report = self
            .write_step(ctx, run, &df, req, "write:corporate_actions")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }
        if df.height() == 0 {
            return Ok(RunStatus::Success);
        }

        self.load_step(ctx, run, &df, WarehouseTable::CorporateActions)
            .await
    }

    /// Derived reference dataset: one row per calendar day of the
    /// year, weekends marked non-trading.
    async fn run_calendar(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let year = trade_date.year();
        let mut dates = Vec::new();
        let mut trading = Vec::new();

        let mut day = NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| {
            SystemError::InvariantViolation(format!("invalid calendar year {year}"))
        })?;
        while day.year() == year {
            dates.push(days_since_epoch(day));
            trading.push(!matches!(
                day.weekday(),
                chrono::Weekday::Sat | chrono::Weekday::Sun
            ));
            day = day.succ_opt().ok_or_else(|| {
                SystemError::InvariantViolation("calendar overflow".to_string())
            })?;
        }

        let n = dates.len();
        let df = polars::prelude::df! {
            CanonicalCol::CalendarDate.as_str() => dates,
            CanonicalCol::Exchange.as_str() => vec!["NSE".to_string(); n],
            CanonicalCol::IsTradingDay.as_str() => trading,
            CanonicalCol::HolidayName.as_str() => vec![None::<String>; n],
            CanonicalCol::Year.as_str() => vec![year; n],
        }
        .map_err(|e| DataError::Frame(e.to_string()))?;
        let df = crate::parse::conform_to_schema(df, &trading_calendar_schema())?;

        let req = WriteRequest::new(
            Layer::Reference,
            "trading_calendar",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_partition_cols(vec![CanonicalCol::Year])
        .with_key(year.to_string())
        .with_file_stem(format!("calendar_{year}"));

        let report = self
            .write_step(ctx, run, &df, req, "write:trading_calendar")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }

        self.load_step(ctx, run, &df, WarehouseTable::TradingCalendar)
            .await
    }

    async fn run_financials(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        trade_date: NaiveDate,
    ) -> MandiResult<RunStatus> {
        let mut combined: Option<DataFrame> = None;

        for symbol in TRACKED_FILERS {
            let params = FetchParams::for_date(trade_date).with_symbol(symbol);
            let raw = match self
                .fetch_step(
                    ctx,
                    run,
                    Source::NseXbrlFiling,
                    &params,
                    &format!("fetch:xbrl:{symbol}"),
                )
                .await
            {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    // Filings arrive unevenly; one missing filer does
                    // not void the quarter.
                    tracing::warn!(symbol, error = %e, "xbrl_filer_degraded");
                    continue;
                }
            };

            let pctx = ParseContext::new(Source::NseXbrlFiling, trade_date).with_symbol(symbol);
            let df = self
                .parse_step(
                    run,
                    XbrlFinancialsParser,
                    raw,
                    pctx,
                    &format!("parse:xbrl:{symbol}"),
                )
                .await?;

            combined = Some(match combined {
                None => df,
                Some(mut acc) => {
                    acc.vstack_mut(&df)
                        .map_err(|e| DataError::Frame(e.to_string()))?;
                    acc
                }
            });
        }

        let df = combined.unwrap_or_else(|| {
            DataFrame::empty_with_schema(&crate::schema::quarterly_financials_schema())
        });

        let mut req = WriteRequest::new(
            Layer::Reference,
            "quarterly_financials",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_schema_name("quarterly_financials")
        .with_quarantine_dir(&self.config.storage.quarantine_dir)
        .with_file_stem(format!("financials_{}", trade_date.format("%Y%m%d")))
        .apply_policy(&self.config.pipeline);
        if df.height() == 0 {
            req = req.with_metadata("skipped", "download_failed");
        }

        let report = self
            .write_step(ctx, run, &df, req, "write:quarterly_financials")
            .await?;
        if report.idempotent_skip {
            return Ok(RunStatus::SkippedIdempotent);
        }
        if df.height() == 0 {
            return Ok(RunStatus::Success);
        }

        self.load_step(ctx, run, &df, WarehouseTable::QuarterlyFinancials)
            .await
    }

    // ============================================================================================
    // Steps
    // ============================================================================================

    /// Fetch behind the source's breaker and retry budget. `Ok(None)`
    /// is the not-found outcome (record a zero-row marker downstream).
    async fn fetch_step(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        source: Source,
        params: &FetchParams,
        label: &str,
    ) -> MandiResult<Option<Bytes>> {
        ctx.check_active()?;
        let started = Instant::now();
        let breaker = self
            .breakers
            .get_or_create(source.as_str(), source.breaker_config());
        let policy = source.retry_policy().with_deadline(ctx.remaining());

        let result = policy
            .run(label, Some(&breaker), || {
                let fetcher = self.fetcher.clone();
                let params = params.clone();
                async move { fetcher.fetch(source, &params).await }
            })
            .await;

        match result {
            Ok(FetchOutcome::Payload(raw)) => {
                run.record_step(label, 1, started.elapsed(), None);
                Ok(Some(raw))
            }
            Ok(FetchOutcome::NotFound) => {
                tracing::info!(source = source.as_str(), "fetch_not_found_continuing");
                run.record_step(label, 0, started.elapsed(), None);
                Ok(None)
            }
            Err(e) => {
                run.record_step(label, 0, started.elapsed(), Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Parse on the CPU pool; the async workers stay free for I/O.
    async fn parse_step<P>(
        &self,
        run: &mut PipelineRun,
        parser: P,
        raw: Bytes,
        pctx: ParseContext,
        label: &str,
    ) -> MandiResult<DataFrame>
    where
        P: SourceParser + 'static,
    {
        let started = Instant::now();
        let source = pctx.source;

        let (send, recv) = tokio::sync::oneshot::channel();
        rayon::spawn(move || {
            let _ = send.send(parser.parse(&raw, &pctx));
        });
        let result = recv
            .await
            .map_err(|_| SystemError::Join("parse worker dropped".to_string()))?;

        match &result {
            Ok(df) => {
                metrics::rows_parsed(source.as_str(), "ok", df.height() as u64);
                run.record_step(label, df.height() as u64, started.elapsed(), None);
            }
            Err(e) => {
                metrics::rows_parsed(source.as_str(), "failed", 0);
                run.record_step(label, 0, started.elapsed(), Some(e.to_string()));
            }
        }
        result
    }

    async fn write_step(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        df: &DataFrame,
        req: WriteRequest,
        label: &str,
    ) -> MandiResult<WriteReport> {
        ctx.check_active()?;
        let started = Instant::now();

        let writer = self.writer.clone();
        let frame = df.clone();
        let result = tokio::task::spawn_blocking(move || writer.write(&frame, &req))
            .await
            .map_err(|e| SystemError::Join(e.to_string()))?;

        match &result {
            Ok(report) => {
                run.record_step(label, report.rows, started.elapsed(), None);
            }
            Err(e) => {
                run.record_step(label, 0, started.elapsed(), Some(e.to_string()));
            }
        }
        result
    }

    /// Warehouse load, best-effort relative to the lake write: a failed
    /// load fails the run but never touches the lake output.
    async fn load_step(
        &self,
        ctx: &RunContext,
        run: &mut PipelineRun,
        df: &DataFrame,
        table: WarehouseTable,
    ) -> MandiResult<RunStatus> {
        let Some(loader) = &self.loader else {
            return Ok(RunStatus::Success);
        };
        let label = format!("load:{table}");
        let started = Instant::now();

        match loader.load_frame(df, table, Some(&ctx.cancel)).await {
            Ok(report) => {
                run.record_step(&label, report.rows, started.elapsed(), None);
                Ok(RunStatus::Success)
            }
            Err(e) => {
                tracing::error!(table = table.as_str(), error = %e, "warehouse_load_failed_lake_retained");
                run.record_step(&label, 0, started.elapsed(), Some(e.to_string()));
                Ok(RunStatus::Failed)
            }
        }
    }

    // ============================================================================================
    // Helpers
    // ============================================================================================

    fn equity_write_request(&self, trade_date: NaiveDate) -> WriteRequest {
        WriteRequest::new(
            Layer::Normalized,
            "equity_ohlc",
            &self.config.storage.data_dir,
            trade_date,
        )
        .with_schema_name("normalized_equity_ohlc")
        .with_quarantine_dir(&self.config.storage.quarantine_dir)
        .with_metadata("table", WarehouseTable::NormalizedEquityOhlc.as_str())
        .apply_policy(&self.config.pipeline)
    }

    /// Fetch and parse one equity source, tolerating failure: `None`
    /// stands for "this source is unavailable today".
    async fn tolerant_source_frame(
        &self,
        ctx: &RunContext,
        source: Source,
        params: &FetchParams,
        trade_date: NaiveDate,
    ) -> Option<DataFrame> {
        let breaker = self
            .breakers
            .get_or_create(source.as_str(), source.breaker_config());
        let policy = source.retry_policy().with_deadline(ctx.remaining());

        let fetched = policy
            .run(source.as_str(), Some(&breaker), || {
                let fetcher = self.fetcher.clone();
                let params = params.clone();
                async move { fetcher.fetch(source, &params).await }
            })
            .await;

        let raw = match fetched {
            Ok(FetchOutcome::Payload(raw)) => raw,
            Ok(FetchOutcome::NotFound) => return None,
            Err(e) => {
                tracing::warn!(source = source.as_str(), error = %e, "source_unavailable");
                return None;
            }
        };

        let pctx = ParseContext::new(source, trade_date);
        let parsed = match source {
            Source::BseEqBar => BseBarParser.parse(&raw, &pctx),
            _ => NseBarParser.parse(&raw, &pctx),
        };
        match parsed {
            Ok(df) => {
                metrics::rows_parsed(source.as_str(), "ok", df.height() as u64);
                Some(df)
            }
            Err(e) => {
                metrics::rows_parsed(source.as_str(), "failed", 0);
                tracing::warn!(source = source.as_str(), error = %e, "source_parse_failed");
                None
            }
        }
    }

    async fn tolerant_master_frame(
        &self,
        ctx: &RunContext,
        trade_date: NaiveDate,
    ) -> Option<DataFrame> {
        let source = Source::NseMaster;
        let params = FetchParams::for_date(trade_date);
        let breaker = self
            .breakers
            .get_or_create(source.as_str(), source.breaker_config());

        let fetched = source
            .retry_policy()
            .with_deadline(ctx.remaining())
            .run(source.as_str(), Some(&breaker), || {
                let fetcher = self.fetcher.clone();
                let params = params.clone();
                async move { fetcher.fetch(source, &params).await }
            })
            .await;

        match fetched {
            Ok(FetchOutcome::Payload(raw)) => {
                let pctx = ParseContext::new(source, trade_date);
                SymbolMasterParser.parse(&raw, &pctx).ok()
            }
            _ => None,
        }
    }

    /// Corporate-action disclosures for the price-adjustment step. An
    /// unavailable feed degrades to no repricing.
    async fn tolerant_actions_frame(
        &self,
        ctx: &RunContext,
        trade_date: NaiveDate,
    ) -> Option<DataFrame> {
        let source = Source::NseCorporateActions;
        let params = FetchParams::for_date(trade_date);
        let breaker = self
            .breakers
            .get_or_create(source.as_str(), source.breaker_config());

        let fetched = source
            .retry_policy()
            .with_deadline(ctx.remaining())
            .run(source.as_str(), Some(&breaker), || {
                let fetcher = self.fetcher.clone();
                let params = params.clone();
                async move { fetcher.fetch(source, &params).await }
            })
            .await;

        match fetched {
            Ok(FetchOutcome::Payload(raw)) => {
                let pctx = ParseContext::new(source, trade_date);
                match CorporateActionsParser.parse(&raw, &pctx) {
                    Ok(actions) => Some(actions),
                    Err(e) => {
                        tracing::warn!(error = %e, "corporate_actions_parse_failed_skipping_adjustment");
                        None
                    }
                }
            }
            _ => None,
        }
    }
}
