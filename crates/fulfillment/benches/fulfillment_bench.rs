use criterion::{Criterion, criterion_group, criterion_main};
use domain::{CartItem, DeliveryProfile, Money, Product, Store, StoreId, User, UserId, UserRole};
use fulfillment::{
    FulfillmentConfig, FulfillmentOrchestrator, NoopNotifier, ScriptedPartnerGateway, SystemClock,
};
use repository::{InMemoryRepository, Repository};

type BenchOrchestrator =
    FulfillmentOrchestrator<InMemoryRepository, ScriptedPartnerGateway, NoopNotifier, SystemClock>;

struct Fixture {
    orchestrator: BenchOrchestrator,
    repo: InMemoryRepository,
    owner: UserId,
    store: StoreId,
    products: Vec<Product>,
}

async fn fixture(product_count: usize) -> Fixture {
    let repo = InMemoryRepository::new();
    let owner = User::new(UserRole::StoreOwner);
    let store = Store::new(owner.id, "1 Bench Rd");
    repo.save_user(&owner).await.unwrap();
    repo.save_store(&store).await.unwrap();

    let mut products = Vec::new();
    for i in 0..product_count {
        let product = Product::new(
            store.id,
            format!("Item {i}"),
            "bench",
            Money::from_cents(199),
            u32::MAX / 2,
        );
        repo.save_product(&product).await.unwrap();
        products.push(product);
    }

    let orchestrator = FulfillmentOrchestrator::new(
        repo.clone(),
        ScriptedPartnerGateway::new(),
        NoopNotifier,
        SystemClock,
        FulfillmentConfig::default(),
    );
    Fixture {
        orchestrator,
        repo,
        owner: owner.id,
        store: store.id,
        products,
    }
}

async fn fill_cart(f: &Fixture) -> UserId {
    let customer = User::new(UserRole::Customer);
    f.repo.save_user(&customer).await.unwrap();
    for product in &f.products {
        f.repo
            .save_cart_item(&CartItem::new(customer.id, product.id, 1).unwrap())
            .await
            .unwrap();
    }
    customer.id
}

fn bench_place_order(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let f = rt.block_on(fixture(5));

    c.bench_function("fulfillment/place_order_5_lines", |b| {
        b.iter(|| {
            rt.block_on(async {
                let customer = fill_cart(&f).await;
                f.orchestrator.place_order(customer, f.store).await.unwrap();
            });
        });
    });
}

fn bench_order_lifecycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (f, partner) = rt.block_on(async {
        let f = fixture(1).await;
        let partner = User::new(UserRole::DeliveryPartner);
        f.repo.save_user(&partner).await.unwrap();
        f.repo
            .save_delivery_profile(&DeliveryProfile::new(partner.id))
            .await
            .unwrap();
        (f, partner.id)
    });

    c.bench_function("fulfillment/place_to_delivered", |b| {
        b.iter(|| {
            rt.block_on(async {
                let customer = fill_cart(&f).await;
                let order = f.orchestrator.place_order(customer, f.store).await.unwrap();
                f.orchestrator.accept_order(order.id, f.owner).await.unwrap();
                f.orchestrator.start_preparing(order.id, f.owner).await.unwrap();
                f.orchestrator.mark_ready(order.id, f.owner).await.unwrap();
                f.orchestrator.mark_delivered(order.id, partner).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_place_order, bench_order_lifecycle);
criterion_main!(benches);
