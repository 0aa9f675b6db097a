pub mod product;
pub mod stock_movement;
pub mod stock_record;
pub mod warehouse;

pub use product::{Entity as Product, Model as ProductModel};
pub use stock_movement::{
    Entity as StockMovement, Model as StockMovementModel, MovementDirection, MovementType,
    ReferenceType,
};
pub use stock_record::{Entity as StockRecord, Model as StockRecordModel};
pub use warehouse::{Entity as Warehouse, Model as WarehouseModel};
