use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::oneshot;

use stockline_events::{EventBus, FieldChanged, InMemoryEventBus};
use stockline_stock::error::{ServiceError, ServiceResult};
use stockline_stock::services::{
    BatchSerialSelection, Bom, BomExpansionRequest, BomItem, ItemDetails, ItemDetailsQuery,
    ItemMasterService, LocationDetails, ProductionItem, RateQuery, SampleQuery, SelectionOutcome,
    SerialNoQuery, UomQuery, ValuationService, WorkOrderDetails,
};
use stockline_stock::{
    AdditionalCost, CallKind, EngineConfig, EngineError, Form, HasLineItems, InMemoryStockServices,
    ServiceCall, StockEntry, StockEntryEngine, StockEntryPurpose, StockEntryRow, StockServices,
};

fn engine_for(services: Arc<InMemoryStockServices>) -> StockEntryEngine {
    stockline_observability::init_for_tests();
    StockEntryEngine::new(StockServices::from_shared(services), EngineConfig::default())
}

fn single_row_entry(purpose: StockEntryPurpose, row: StockEntryRow) -> (Form<StockEntry>, stockline_core::RowId) {
    let mut doc = StockEntry::new("Acme", purpose);
    let row_id = doc.add_row(row);
    (Form::new(doc), row_id)
}

fn rate_queries(services: &InMemoryStockServices) -> Vec<RateQuery> {
    services
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            ServiceCall::IncomingRate(query) => Some(query),
            _ => None,
        })
        .collect()
}

/// Rate lookups that block until the test releases them, keyed by the
/// absolute quantity of the request.
struct GatedValuation {
    inner: Arc<InMemoryStockServices>,
    gates: Mutex<HashMap<Decimal, oneshot::Receiver<Decimal>>>,
}

impl GatedValuation {
    fn new(inner: Arc<InMemoryStockServices>) -> Self {
        Self {
            inner,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, qty: Decimal) -> oneshot::Sender<Decimal> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().unwrap().insert(qty.normalize(), rx);
        tx
    }
}

#[async_trait]
impl ValuationService for GatedValuation {
    async fn incoming_rate(&self, query: &RateQuery) -> ServiceResult<Option<Decimal>> {
        let gate = self.gates.lock().unwrap().remove(&query.qty.abs().normalize());
        match gate {
            Some(rx) => rx
                .await
                .map(Some)
                .map_err(|_| ServiceError::Unavailable("gate dropped".to_string())),
            None => self.inner.incoming_rate(query).await,
        }
    }

    async fn location_details(&self, query: &RateQuery) -> ServiceResult<Option<LocationDetails>> {
        self.inner.location_details(query).await
    }

    async fn serial_nos(&self, query: &SerialNoQuery) -> ServiceResult<Option<String>> {
        self.inner.serial_nos(query).await
    }
}

/// Item master answers that block until the test releases them.
struct GatedItemMaster {
    inner: Arc<InMemoryStockServices>,
    details: Mutex<Option<oneshot::Receiver<ItemDetails>>>,
    uom: Mutex<Option<oneshot::Receiver<ItemDetails>>>,
}

impl GatedItemMaster {
    fn new(inner: Arc<InMemoryStockServices>) -> Self {
        Self {
            inner,
            details: Mutex::new(None),
            uom: Mutex::new(None),
        }
    }

    fn gate_details(&self) -> oneshot::Sender<ItemDetails> {
        let (tx, rx) = oneshot::channel();
        *self.details.lock().unwrap() = Some(rx);
        tx
    }

    fn gate_uom(&self) -> oneshot::Sender<ItemDetails> {
        let (tx, rx) = oneshot::channel();
        *self.uom.lock().unwrap() = Some(rx);
        tx
    }
}

#[async_trait]
impl ItemMasterService for GatedItemMaster {
    async fn item_details(&self, query: &ItemDetailsQuery) -> ServiceResult<Option<ItemDetails>> {
        let gate = self.details.lock().unwrap().take();
        match gate {
            Some(rx) => Ok(rx.await.ok()),
            None => self.inner.item_details(query).await,
        }
    }

    async fn uom_details(&self, query: &UomQuery) -> ServiceResult<Option<ItemDetails>> {
        let gate = self.uom.lock().unwrap().take();
        match gate {
            Some(rx) => Ok(rx.await.ok()),
            None => self.inner.uom_details(query).await,
        }
    }

    async fn retainable_sample_qty(&self, query: &SampleQuery) -> ServiceResult<Option<Decimal>> {
        self.inner.retainable_sample_qty(query).await
    }
}

fn gated_item_master_engine() -> (StockEntryEngine, Arc<GatedItemMaster>) {
    let inner = Arc::new(InMemoryStockServices::new());
    let gated = Arc::new(GatedItemMaster::new(inner.clone()));
    stockline_observability::init_for_tests();
    let engine = StockEntryEngine::new(
        StockServices::from_shared(inner).with_item_master(gated.clone()),
        EngineConfig::default(),
    );
    (engine, gated)
}

#[tokio::test]
async fn uom_conversion_and_rate_give_basic_amount() {
    let services = Arc::new(InMemoryStockServices::new().with_rate("NAIL-BOX", dec!(3.5)));
    let engine = engine_for(services.clone());
    let row = StockEntryRow::new()
        .with_item("NAIL-BOX")
        .with_qty(dec!(10))
        .with_conversion_factor(dec!(2))
        .with_target("Stores");
    let (form, row_id) = single_row_entry(StockEntryPurpose::MaterialReceipt, row);

    let changes = engine.on_quantity_changed(&form, row_id).await.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.transfer_qty, dec!(20));
    assert_eq!(row.basic_rate, dec!(3.50));
    assert_eq!(row.valuation_rate, dec!(3.50));
    assert_eq!(row.basic_amount, dec!(70.00));
    assert!(changes.touched(Some(row_id), "basic_amount"));
    assert_eq!(rate_queries(&services)[0].qty, dec!(20));
}

#[tokio::test]
async fn repeating_a_settled_recompute_changes_nothing() {
    let services = Arc::new(InMemoryStockServices::new().with_rate("NAIL-BOX", dec!(3.5)));
    let engine = engine_for(services);
    let row = StockEntryRow::new()
        .with_item("NAIL-BOX")
        .with_qty(dec!(10))
        .with_conversion_factor(dec!(2))
        .with_source("Stores");
    let (form, row_id) = single_row_entry(StockEntryPurpose::MaterialIssue, row);

    let first = engine.on_quantity_changed(&form, row_id).await.unwrap();
    let second = engine.on_quantity_changed(&form, row_id).await.unwrap();

    assert!(!first.is_empty());
    assert!(second.is_empty());
}

#[tokio::test]
async fn failed_location_lookup_leaves_row_unchanged() {
    let services = Arc::new(InMemoryStockServices::new());
    services.fail(CallKind::LocationDetails);
    let engine = engine_for(services.clone());
    let mut row = StockEntryRow::new()
        .with_item("NAIL")
        .with_qty(dec!(5))
        .with_target("Shop");
    row.actual_qty = dec!(12);
    row.basic_rate = dec!(1.25);
    let (form, row_id) = single_row_entry(StockEntryPurpose::MaterialReceipt, row);

    let changes = engine.on_target_location_changed(&form, row_id).await.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert!(changes.is_empty());
    assert_eq!(row.actual_qty, dec!(12));
    assert_eq!(row.basic_rate, dec!(1.25));
    assert_eq!(services.count(CallKind::LocationDetails), 1);
}

#[tokio::test]
async fn failed_item_lookup_is_not_an_error() {
    let services = Arc::new(InMemoryStockServices::new().with_rate("NAIL", dec!(1)));
    services.fail(CallKind::ItemDetails);
    let engine = engine_for(services.clone());
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialTransfer,
        StockEntryRow::new().with_item("NAIL").with_qty(dec!(1)),
    );

    let changes = engine.on_item_changed(&form, row_id).await.unwrap();

    assert!(changes.is_empty());
    assert_eq!(services.call_kinds(), vec![CallKind::ItemDetails]);
}

#[tokio::test]
async fn serial_selection_completes_before_rate_lookup() {
    let details = ItemDetails::new()
        .with("item_name", "Drill")
        .with("stock_uom", "Nos")
        .with("has_serial_no", 1)
        .with("has_batch_no", 0)
        .with("unknown_field", "ignored");
    let selection = BatchSerialSelection {
        batch_no: None,
        serial_nos: vec!["DRL-001".to_string(), "DRL-002".to_string()],
        qty: Some(dec!(2)),
    };
    let services = Arc::new(
        InMemoryStockServices::new()
            .with_item_details("DRILL", details)
            .with_selection("DRILL", SelectionOutcome::Selected(selection))
            .with_rate("DRILL", dec!(80)),
    );
    let engine = engine_for(services.clone());
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialIssue,
        StockEntryRow::new().with_item("DRILL").with_source("Stores"),
    );

    engine.on_item_changed(&form, row_id).await.unwrap();

    assert_eq!(
        services.call_kinds(),
        vec![CallKind::ItemDetails, CallKind::Select, CallKind::IncomingRate]
    );
    let query = rate_queries(&services).remove(0);
    assert_eq!(query.serial_no.as_deref(), Some("DRL-001\nDRL-002"));
    assert_eq!(query.qty, dec!(-2));

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.item_name.as_deref(), Some("Drill"));
    assert!(row.has_serial_no);
    assert_eq!(row.transfer_qty, dec!(2));
    assert_eq!(row.basic_amount, dec!(160.00));
}

#[tokio::test]
async fn skipped_selection_still_prices_the_row() {
    let services = Arc::new(
        InMemoryStockServices::new()
            .with_item_details("FLOUR", ItemDetails::new().with("has_batch_no", true))
            .with_rate("FLOUR", dec!(0.8)),
    );
    let engine = engine_for(services.clone());
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialTransfer,
        StockEntryRow::new()
            .with_item("FLOUR")
            .with_qty(dec!(25))
            .with_source("Stores"),
    );

    engine.on_item_changed(&form, row_id).await.unwrap();

    assert_eq!(
        services.call_kinds(),
        vec![CallKind::ItemDetails, CallKind::Select, CallKind::IncomingRate]
    );
    assert_eq!(form.snapshot().await.items[0].basic_amount, dec!(20.00));
}

#[tokio::test]
async fn receipts_and_hidden_selector_never_open_the_selector() {
    let details = ItemDetails::new().with("has_serial_no", true);
    let services = Arc::new(InMemoryStockServices::new().with_item_details("DRILL", details));

    let engine = engine_for(services.clone());
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialReceipt,
        StockEntryRow::new().with_item("DRILL").with_target("Stores"),
    );
    engine.on_item_changed(&form, row_id).await.unwrap();
    assert_eq!(services.count(CallKind::Select), 0);

    let hidden = StockEntryEngine::new(
        StockServices::from_shared(services.clone()),
        EngineConfig::default().with_hidden_selector(true),
    );
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialIssue,
        StockEntryRow::new().with_item("DRILL").with_source("Stores"),
    );
    hidden.on_item_changed(&form, row_id).await.unwrap();
    assert_eq!(services.count(CallKind::Select), 0);
}

#[tokio::test]
async fn stale_rate_response_is_discarded() {
    let inner = Arc::new(InMemoryStockServices::new());
    let gated = Arc::new(GatedValuation::new(inner.clone()));
    let first_gate = gated.gate(dec!(5));
    let second_gate = gated.gate(dec!(8));
    stockline_observability::init_for_tests();
    let engine = StockEntryEngine::new(
        StockServices::from_shared(inner).with_valuation(gated),
        EngineConfig::default(),
    );
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialReceipt,
        StockEntryRow::new().with_item("NAIL").with_target("Stores"),
    );

    let first_edit = async {
        form.edit(|doc| doc.items[0].qty = dec!(5)).await;
        engine.on_quantity_changed(&form, row_id).await
    };
    let second_edit = async {
        tokio::task::yield_now().await;
        form.edit(|doc| doc.items[0].qty = dec!(8)).await;
        engine.on_quantity_changed(&form, row_id).await
    };
    let responses = async {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        second_gate.send(dec!(2)).unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        first_gate.send(dec!(1)).unwrap();
    };

    let (first, second, ()) = tokio::join!(first_edit, second_edit, responses);
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(!first.touched(Some(row_id), "basic_rate"));
    assert!(second.touched(Some(row_id), "basic_rate"));
    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.transfer_qty, dec!(8));
    assert_eq!(row.basic_rate, dec!(2));
    assert_eq!(row.basic_amount, dec!(16));
}

#[tokio::test]
async fn latest_of_three_edits_wins_regardless_of_response_order() {
    let inner = Arc::new(InMemoryStockServices::new());
    let gated = Arc::new(GatedValuation::new(inner.clone()));
    let gate_3 = gated.gate(dec!(3));
    let gate_6 = gated.gate(dec!(6));
    let gate_9 = gated.gate(dec!(9));
    stockline_observability::init_for_tests();
    let engine = StockEntryEngine::new(
        StockServices::from_shared(inner).with_valuation(gated),
        EngineConfig::default(),
    );
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialReceipt,
        StockEntryRow::new().with_item("NAIL").with_target("Stores"),
    );

    let edit = |qty: Decimal, delay: usize| {
        let form = form.clone();
        let engine = engine.clone();
        async move {
            for _ in 0..delay {
                tokio::task::yield_now().await;
            }
            form.edit(|doc| doc.items[0].qty = qty).await;
            engine.on_quantity_changed(&form, row_id).await
        }
    };
    let responses = async {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        gate_9.send(dec!(9.5)).unwrap();
        gate_3.send(dec!(3.5)).unwrap();
        tokio::task::yield_now().await;
        gate_6.send(dec!(6.5)).unwrap();
    };

    let (a, b, c, ()) = tokio::join!(edit(dec!(3), 0), edit(dec!(6), 2), edit(dec!(9), 4), responses);
    a.unwrap();
    b.unwrap();
    c.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.transfer_qty, dec!(9));
    assert_eq!(row.basic_rate, dec!(9.50));
    assert_eq!(row.basic_amount, dec!(85.50));
}

#[tokio::test]
async fn manual_rate_edit_supersedes_pending_lookup() {
    let inner = Arc::new(InMemoryStockServices::new());
    let gated = Arc::new(GatedValuation::new(inner.clone()));
    let gate = gated.gate(dec!(4));
    stockline_observability::init_for_tests();
    let engine = StockEntryEngine::new(
        StockServices::from_shared(inner).with_valuation(gated),
        EngineConfig::default(),
    );
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialReceipt,
        StockEntryRow::new()
            .with_item("NAIL")
            .with_qty(dec!(4))
            .with_target("Stores"),
    );

    let lookup = engine.on_quantity_changed(&form, row_id);
    let manual = async {
        tokio::task::yield_now().await;
        form.edit(|doc| doc.items[0].basic_rate = dec!(7)).await;
        let changes = engine.on_valuation_rate_changed(&form, row_id).await;
        gate.send(dec!(1)).unwrap();
        changes
    };
    let (lookup, manual) = tokio::join!(lookup, manual);
    lookup.unwrap();
    manual.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.basic_rate, dec!(7));
    assert_eq!(row.valuation_rate, dec!(7));
    assert_eq!(row.basic_amount, dec!(28));
}

#[tokio::test]
async fn header_source_warehouse_flows_into_rows() {
    let services = Arc::new(InMemoryStockServices::new().with_location_details(
        "NAIL",
        "Stores",
        LocationDetails {
            actual_qty: Some(dec!(40)),
            basic_rate: Some(dec!(0.5)),
        },
    ));
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::MaterialTransfer);
    let nail = doc.add_row(StockEntryRow::new().with_item("NAIL").with_qty(dec!(2)));
    let blank = doc.add_row(StockEntryRow::new());
    doc.from_warehouse = Some("Stores".to_string());
    let form = Form::new(doc);

    engine.on_from_location_changed(&form).await.unwrap();

    let doc = form.snapshot().await;
    assert_eq!(doc.row(nail).unwrap().s_warehouse.as_deref(), Some("Stores"));
    assert_eq!(doc.row(nail).unwrap().actual_qty, dec!(40));
    assert_eq!(doc.row(blank).unwrap().s_warehouse.as_deref(), Some("Stores"));
    assert_eq!(services.count(CallKind::LocationDetails), 1);
}

#[tokio::test]
async fn consumption_purpose_is_reverted_when_disabled() {
    let services = Arc::new(InMemoryStockServices::new().with_material_consumption(false));
    let bus = Arc::new(InMemoryEventBus::<FieldChanged>::new());
    let subscription = bus.subscribe();
    let engine = engine_for(services).with_publisher(bus.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::MaterialConsumptionForManufacture);
    doc.supplier = Some("Bolt Supplies".to_string());
    let form = Form::new(doc);

    let err = engine
        .on_purpose_changed(&form, StockEntryPurpose::Manufacture)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        EngineError::business_rule("purpose", "Material Consumption is not set in Manufacturing Settings.")
    );
    let doc = form.snapshot().await;
    assert_eq!(doc.purpose, StockEntryPurpose::Manufacture);
    assert_eq!(doc.supplier.as_deref(), Some("Bolt Supplies"));

    let published = subscription.drain();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].field, "purpose");
    assert!(published[0].is_header());
}

#[tokio::test]
async fn consumption_purpose_is_kept_when_enabled() {
    let services = Arc::new(InMemoryStockServices::new().with_material_consumption(true));
    let engine = engine_for(services);
    let form = Form::new(StockEntry::new(
        "Acme",
        StockEntryPurpose::MaterialConsumptionForManufacture,
    ));

    engine
        .on_purpose_changed(&form, StockEntryPurpose::Manufacture)
        .await
        .unwrap();

    assert_eq!(
        form.snapshot().await.purpose,
        StockEntryPurpose::MaterialConsumptionForManufacture
    );
}

#[tokio::test]
async fn bom_expansion_appends_priced_rows() {
    let mut sugar = BomItem::new("SUGAR", dec!(2));
    sugar.stock_uom = Some("Kg".to_string());
    let mut box_item = BomItem::new("BOX", dec!(1));
    box_item.conversion_factor = Some(dec!(12));
    let services = Arc::new(
        InMemoryStockServices::new()
            .with_bom_items("BOM-CAKE-001", vec![sugar, box_item])
            .with_rate("SUGAR", dec!(1.2))
            .with_rate("BOX", dec!(0.1)),
    );
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::MaterialIssue);
    doc.add_row(StockEntryRow::new());
    let form = Form::new(doc);

    let request = BomExpansionRequest {
        bom_no: "BOM-CAKE-001".to_string(),
        qty: dec!(1),
        source_warehouse: Some("Stores".to_string()),
        target_warehouse: Some("Kitchen".to_string()),
        fetch_exploded: true,
    };
    engine.expand_bom(&form, request).await.unwrap();

    let doc = form.snapshot().await;
    assert_eq!(doc.items.len(), 2);
    let sugar = &doc.items[0];
    assert_eq!(sugar.item_code.as_deref(), Some("SUGAR"));
    assert_eq!(sugar.uom.as_deref(), Some("Kg"));
    assert_eq!(sugar.conversion_factor, dec!(1));
    assert_eq!(sugar.s_warehouse.as_deref(), Some("Stores"));
    assert_eq!(sugar.t_warehouse, None);
    assert_eq!(sugar.basic_amount, dec!(2.40));
    let boxes = &doc.items[1];
    assert_eq!(boxes.transfer_qty, dec!(12));
    assert_eq!(boxes.basic_amount, dec!(1.20));
    assert_eq!(services.count(CallKind::IncomingRate), 2);
}

#[tokio::test]
async fn bom_expansion_failures() {
    let services = Arc::new(InMemoryStockServices::new().with_bom_items("BOM-EMPTY", Vec::new()));
    let engine = engine_for(services.clone());
    let form = Form::new(StockEntry::new("Acme", StockEntryPurpose::Manufacture));
    let request = |bom_no: &str| BomExpansionRequest {
        bom_no: bom_no.to_string(),
        qty: dec!(1),
        source_warehouse: None,
        target_warehouse: None,
        fetch_exploded: false,
    };

    let err = engine.expand_bom(&form, request("BOM-EMPTY")).await.unwrap_err();
    assert_eq!(err.user_message(), "BOM does not contain any stock item");

    services.fail(CallKind::BomItems);
    let changes = engine.expand_bom(&form, request("BOM-EMPTY")).await.unwrap();
    assert!(changes.is_empty());

    let mut no_company = StockEntry::new("Acme", StockEntryPurpose::Manufacture);
    no_company.company = None;
    let err = engine
        .expand_bom(&Form::new(no_company), request("BOM-EMPTY"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn header_bom_marks_alternative_items() {
    let mut flour = BomItem::new("FLOUR", dec!(2));
    flour.allow_alternative_item = true;
    let services = Arc::new(
        InMemoryStockServices::new()
            .with_bom(Bom {
                name: "BOM-BREAD-001".to_string(),
                items: vec![flour],
            })
            .with_item_details("FLOUR", ItemDetails::new().with("stock_uom", "Kg")),
    );
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::Manufacture);
    doc.bom_no = Some("BOM-BREAD-001".to_string());
    let row_id = doc.add_row(StockEntryRow::new().with_item("FLOUR"));
    let form = Form::new(doc);

    engine.on_bom_changed(&form).await.unwrap();
    engine.on_item_changed(&form, row_id).await.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert!(row.allow_alternative_item);
    assert_eq!(row.original_item.as_deref(), Some("FLOUR"));
    assert_eq!(services.count(CallKind::Bom), 1);
    assert!(engine.layout(&form).await.alternate_item_action);
}

#[tokio::test]
async fn zero_charge_leaves_total_unchanged() {
    let services = Arc::new(InMemoryStockServices::new());
    let engine = engine_for(services);
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::MaterialReceipt);
    let mut freight = AdditionalCost::new(dec!(40));
    freight.base_amount = dec!(40);
    doc.additional_costs.push(freight);
    let form = Form::new(doc);

    engine.recompute_document_totals(&form).await.unwrap();
    assert_eq!(form.snapshot().await.total_additional_costs, dec!(40));

    let free = AdditionalCost::new(Decimal::ZERO);
    let free_id = free.id;
    form.edit(|doc| doc.additional_costs.push(free)).await;
    let changes = engine.on_additional_cost_changed(&form, free_id).await.unwrap();

    assert!(changes.is_empty());
    assert_eq!(form.snapshot().await.total_additional_costs, dec!(40));
}

#[tokio::test]
async fn removed_row_response_is_dropped() {
    let inner = Arc::new(InMemoryStockServices::new());
    let gated = Arc::new(GatedValuation::new(inner.clone()));
    let gate = gated.gate(dec!(3));
    stockline_observability::init_for_tests();
    let engine = StockEntryEngine::new(
        StockServices::from_shared(inner).with_valuation(gated),
        EngineConfig::default(),
    );
    let (form, row_id) = single_row_entry(
        StockEntryPurpose::MaterialReceipt,
        StockEntryRow::new()
            .with_item("NAIL")
            .with_qty(dec!(3))
            .with_target("Stores"),
    );

    let lookup = engine.on_quantity_changed(&form, row_id);
    let removal = async {
        tokio::task::yield_now().await;
        form.remove_row(row_id).await;
        gate.send(dec!(1)).unwrap();
    };
    let (changes, ()) = tokio::join!(lookup, removal);

    assert!(!changes.unwrap().touched(Some(row_id), "basic_rate"));
    assert!(form.snapshot().await.items.is_empty());
}

#[tokio::test]
async fn quantity_typed_during_item_lookup_is_priced_at_the_merged_factor() {
    let (engine, gated) = gated_item_master_engine();
    let details = gated.gate_details();
    let mut row = StockEntryRow::new().with_item("NAIL-BOX").with_target("Stores");
    row.basic_rate = dec!(3);
    let (form, row_id) = single_row_entry(StockEntryPurpose::MaterialReceipt, row);

    let lookup = engine.on_item_changed(&form, row_id);
    let typing = async {
        tokio::task::yield_now().await;
        form.edit(|doc| doc.items[0].qty = dec!(10)).await;
        let typed = engine.on_quantity_changed(&form, row_id).await;
        details
            .send(ItemDetails::new().with("conversion_factor", 2))
            .unwrap();
        typed
    };
    let (looked_up, typed) = tokio::join!(lookup, typing);
    looked_up.unwrap();
    typed.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.conversion_factor, dec!(2));
    assert_eq!(row.transfer_qty, dec!(20));
    assert_eq!(row.basic_rate, dec!(3));
    assert_eq!(row.basic_amount, dec!(60.00));
}

#[tokio::test]
async fn quantity_typed_during_uom_lookup_is_priced_at_the_merged_factor() {
    let (engine, gated) = gated_item_master_engine();
    let uom = gated.gate_uom();
    let mut row = StockEntryRow::new().with_item("NAIL-BOX").with_target("Stores");
    row.uom = Some("Box".to_string());
    row.basic_rate = dec!(3);
    let (form, row_id) = single_row_entry(StockEntryPurpose::MaterialReceipt, row);

    let lookup = engine.on_uom_changed(&form, row_id);
    let typing = async {
        tokio::task::yield_now().await;
        form.edit(|doc| doc.items[0].qty = dec!(10)).await;
        let typed = engine.on_quantity_changed(&form, row_id).await;
        uom.send(ItemDetails::new().with("conversion_factor", 2)).unwrap();
        typed
    };
    let (looked_up, typed) = tokio::join!(lookup, typing);
    looked_up.unwrap();
    typed.unwrap();

    let row = form.snapshot().await.items.remove(0);
    assert_eq!(row.transfer_qty, dec!(20));
    assert_eq!(row.basic_amount, dec!(60.00));
}

fn cake_work_order() -> WorkOrderDetails {
    WorkOrderDetails {
        from_bom: true,
        bom_no: Some("BOM-CAKE-001".to_string()),
        fg_completed_qty: dec!(5),
        use_multi_level_bom: true,
        wip_warehouse: Some("Work In Progress".to_string()),
        fg_warehouse: Some("Finished Goods".to_string()),
    }
}

fn cake_rows() -> Vec<ProductionItem> {
    vec![
        ProductionItem::new("SUGAR", dec!(10)).consumed_from("Work In Progress"),
        ProductionItem::new("CAKE", dec!(5)).produced_into("Finished Goods"),
    ]
}

#[tokio::test]
async fn work_order_fills_the_header_and_replaces_rows() {
    let services = Arc::new(
        InMemoryStockServices::new()
            .with_work_order("WO-0001", cake_work_order())
            .with_production_items("BOM-CAKE-001", cake_rows())
            .with_rate("SUGAR", dec!(1.2)),
    );
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::Manufacture);
    let old_row = doc.add_row(StockEntryRow::new().with_item("OLD"));
    doc.work_order = Some("WO-0001".to_string());
    let form = Form::new(doc);

    let changes = engine.on_work_order_changed(&form).await.unwrap();

    let doc = form.snapshot().await;
    assert!(doc.from_bom);
    assert!(doc.use_multi_level_bom);
    assert_eq!(doc.bom_no.as_deref(), Some("BOM-CAKE-001"));
    assert_eq!(doc.fg_completed_qty, dec!(5));
    assert_eq!(doc.from_warehouse.as_deref(), Some("Work In Progress"));
    assert_eq!(doc.to_warehouse.as_deref(), Some("Finished Goods"));
    assert!(doc.row(old_row).is_none());
    assert_eq!(doc.items.len(), 2);
    assert_eq!(doc.items[0].s_warehouse.as_deref(), Some("Work In Progress"));
    assert_eq!(doc.items[0].basic_amount, dec!(12.00));
    assert_eq!(doc.items[1].t_warehouse.as_deref(), Some("Finished Goods"));
    assert!(changes.touched(None, "bom_no"));
    assert_eq!(services.count(CallKind::ProductionItems), 1);
}

#[tokio::test]
async fn job_card_entries_ignore_the_work_order() {
    let services = Arc::new(InMemoryStockServices::new().with_work_order("WO-0001", cake_work_order()));
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::MaterialTransferForManufacture);
    doc.work_order = Some("WO-0001".to_string());
    doc.job_card = Some("JC-0001".to_string());
    let form = Form::new(doc);

    let changes = engine.on_work_order_changed(&form).await.unwrap();

    assert!(changes.is_empty());
    assert!(services.calls().is_empty());
}

#[tokio::test]
async fn finished_quantity_edit_refetches_rows() {
    let services =
        Arc::new(InMemoryStockServices::new().with_production_items("BOM-CAKE-001", cake_rows()));
    let engine = engine_for(services.clone());
    let mut doc = StockEntry::new("Acme", StockEntryPurpose::Manufacture);
    doc.bom_no = Some("BOM-CAKE-001".to_string());
    let form = Form::new(doc);

    let err = engine.on_fg_completed_qty_changed(&form).await.unwrap_err();
    assert_eq!(err.user_message(), "BOM and Manufacturing Quantity are required");
    assert!(services.calls().is_empty());

    form.edit(|doc| doc.fg_completed_qty = dec!(5)).await;
    engine.on_fg_completed_qty_changed(&form).await.unwrap();

    let doc = form.snapshot().await;
    assert_eq!(doc.items.len(), 2);
    assert_eq!(doc.items[1].item_code.as_deref(), Some("CAKE"));
    assert_eq!(doc.items[1].transfer_qty, dec!(5));
}

#[tokio::test]
async fn bom_expansion_needs_a_quantity() {
    let services = Arc::new(
        InMemoryStockServices::new().with_bom_items("BOM-CAKE-001", vec![BomItem::new("SUGAR", dec!(2))]),
    );
    let engine = engine_for(services.clone());
    let form = Form::new(StockEntry::new("Acme", StockEntryPurpose::MaterialIssue));

    let err = engine
        .expand_bom(
            &form,
            BomExpansionRequest {
                bom_no: "BOM-CAKE-001".to_string(),
                qty: Decimal::ZERO,
                source_warehouse: Some("Stores".to_string()),
                target_warehouse: None,
                fetch_exploded: false,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.user_message(), "Quantity is required");
    assert!(services.calls().is_empty());
    assert!(form.snapshot().await.items.is_empty());
}
